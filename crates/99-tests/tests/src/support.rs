use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fusion_arena::Arena;
use fusion_transport::DeviceOpener;
use fusion_world::{BackendChoice, FusionConfig, MemoryDeviceHub, Registry};
use tempfile::TempDir;
use tracing_subscriber::{fmt, EnvFilter};

pub(crate) const ABI: u32 = 0x0102;

#[derive(Clone, Copy, Debug)]
pub(crate) enum Backend {
    Socket,
    Device,
}

pub(crate) fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

/// Scratch directories (and a device, for the device backend) shared by
/// every simulated process of a test.
pub(crate) struct Cluster {
    _dir: TempDir,
    config: FusionConfig,
    hub: Option<Arc<MemoryDeviceHub>>,
}

impl Cluster {
    pub(crate) fn new(backend: Backend) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let tmpfs = dir.path().join("shm");
        let rundir = dir.path().join("run");
        std::fs::create_dir_all(&tmpfs).expect("tmpfs dir");
        std::fs::create_dir_all(&rundir).expect("run dir");

        let (choice, hub) = match backend {
            Backend::Socket => (BackendChoice::Socket, None),
            Backend::Device => (BackendChoice::Device, Some(Arc::new(MemoryDeviceHub::new()))),
        };
        let config = FusionConfig {
            backend: choice,
            tmpfs,
            rundir,
            enter_timeout_ms: 2_000,
            leave_timeout_ms: 500,
            call_poll_ms: 10,
            ..FusionConfig::default()
        };
        Self {
            _dir: dir,
            config,
            hub,
        }
    }

    pub(crate) fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// A registry standing in for one more process.
    pub(crate) fn process(&self) -> Registry {
        self.process_with(self.config.clone())
    }

    pub(crate) fn process_with(&self, config: FusionConfig) -> Registry {
        let mut builder = Registry::builder().config(config);
        if let Some(hub) = &self.hub {
            let opener: Arc<dyn DeviceOpener> = Arc::clone(hub) as Arc<dyn DeviceOpener>;
            builder = builder.device_opener(opener);
        }
        builder.build().expect("build registry")
    }

    pub(crate) fn core_file(&self, index: u32) -> PathBuf {
        Arena::core_path(&self.config.tmpfs, index)
    }
}

pub(crate) fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Gives stray deliveries a chance to show up before asserting they did not.
pub(crate) fn settle() {
    thread::sleep(Duration::from_millis(50));
}
