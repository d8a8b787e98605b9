//! Join-time configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use fusion_transport::BackendKind;
use serde::{Deserialize, Serialize};

/// Which transport a registry enters worlds through.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    #[default]
    Socket,
    Device,
    Cooperative,
}

impl From<BackendChoice> for BackendKind {
    fn from(choice: BackendChoice) -> Self {
        match choice {
            BackendChoice::Socket => BackendKind::Socket,
            BackendChoice::Device => BackendKind::Device,
            BackendChoice::Cooperative => BackendKind::Cooperative,
        }
    }
}

/// Settings read once when a registry is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    pub backend: BackendChoice,
    /// Directory holding `fusion.<index>.core`.
    pub tmpfs: PathBuf,
    /// Directory holding `.fusion-<index>/` socket directories.
    pub rundir: PathBuf,
    /// Join every world as a slave.
    pub force_slave: bool,
    /// Run kernel-originated calls on a separate thread.
    pub defer_destructors: bool,
    /// Group given to the core file when set.
    pub shmfile_gid: Option<u32>,
    pub enter_timeout_ms: u64,
    /// Bound on joining the dispatch thread during leave.
    pub leave_timeout_ms: u64,
    /// How often a blocked caller checks that the callee is still there.
    pub call_poll_ms: u64,
    /// Device node overriding `/dev/fusion<N>`.
    pub device_path: Option<PathBuf>,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            backend: BackendChoice::Socket,
            tmpfs: PathBuf::from("/dev/shm"),
            rundir: PathBuf::from("/tmp"),
            force_slave: false,
            defer_destructors: false,
            shmfile_gid: None,
            enter_timeout_ms: 5_000,
            leave_timeout_ms: 1_000,
            call_poll_ms: 100,
            device_path: None,
        }
    }
}

impl FusionConfig {
    /// Defaults overridden by `FUSION_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(backend) = var("FUSION_BACKEND").and_then(|raw| parse_backend(&raw)) {
            config.backend = backend;
        }
        if let Some(tmpfs) = var("FUSION_TMPFS") {
            config.tmpfs = tmpfs.into();
        }
        if let Some(rundir) = var("FUSION_RUNDIR") {
            config.rundir = rundir.into();
        }
        if let Some(flag) = var("FUSION_FORCE_SLAVE") {
            config.force_slave = parse_flag(&flag);
        }
        if let Some(flag) = var("FUSION_DEFER_DESTRUCTORS") {
            config.defer_destructors = parse_flag(&flag);
        }
        if let Some(gid) = var("FUSION_SHMFILE_GID") {
            match gid.parse() {
                Ok(gid) => config.shmfile_gid = Some(gid),
                Err(err) => tracing::warn!("ignoring FUSION_SHMFILE_GID={gid}: {err}"),
            }
        }
        config
    }

    pub fn enter_timeout(&self) -> Duration {
        Duration::from_millis(self.enter_timeout_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn call_poll(&self) -> Duration {
        Duration::from_millis(self.call_poll_ms.max(1))
    }
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_flag(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_backend(raw: &str) -> Option<BackendChoice> {
    match raw.to_ascii_lowercase().as_str() {
        "socket" => Some(BackendChoice::Socket),
        "device" => Some(BackendChoice::Device),
        "cooperative" | "single" => Some(BackendChoice::Cooperative),
        other => {
            tracing::warn!("unknown FUSION_BACKEND {other:?}, keeping the default");
            None
        }
    }
}
