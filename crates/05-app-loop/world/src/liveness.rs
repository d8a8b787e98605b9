//! Finding participants that died without saying goodbye.

use std::io;
use std::thread;
use std::time::{Duration, Instant};

use fusion_arena::{pid_alive, Member};
use fusion_transport::ParticipantId;

use crate::world::WorldCore;
use crate::{FusionError, FusionResult};

const EXIT_POLL: Duration = Duration::from_millis(1);

impl WorldCore {
    /// Signals `participant`, or every other participant for
    /// [`ParticipantId::KERNEL`].
    ///
    /// `timeout_ms` bounds the wait for the targets to exit: zero waits
    /// forever, a negative value does not wait at all. Targets found gone
    /// are evicted.
    pub fn kill(&self, participant: ParticipantId, signal: i32, timeout_ms: i32) -> FusionResult<()> {
        self.ensure_open()?;
        let me = self.id();
        let targets: Vec<Member> = if participant.is_kernel() {
            self.arena
                .participants()
                .active()
                .into_iter()
                .filter(|member| member.id != me)
                .collect()
        } else {
            vec![self
                .arena
                .participants()
                .find(participant)
                .ok_or(FusionError::Destroyed("participant"))?]
        };

        let deadline = (timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(timeout_ms as u64));
        for target in targets {
            let Some(pid) = self.arena.participants().pid_of(target.id) else {
                continue;
            };
            match signal_pid(pid, signal) {
                Ok(()) => {}
                Err(err) if err.raw_os_error() == Some(libc::ESRCH) => {
                    self.peer_gone(target.id, target.to_raw(), false);
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            if timeout_ms < 0 {
                continue;
            }
            while pid_alive(pid) {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    return Err(FusionError::Timeout("participant exit"));
                }
                thread::sleep(EXIT_POLL);
            }
            self.peer_gone(target.id, target.to_raw(), false);
        }
        Ok(())
    }

    /// Evicts every participant whose process is gone; returns how many.
    pub fn check_participants(&self) -> usize {
        let me = self.id();
        let dead: Vec<Member> = self
            .arena
            .participants()
            .active()
            .into_iter()
            .filter(|member| member.id != me)
            .filter(|member| {
                self.arena
                    .participants()
                    .pid_of(member.id)
                    .is_some_and(|pid| !pid_alive(pid))
            })
            .collect();
        for member in &dead {
            tracing::info!("world {}: participant {} is dead", self.index(), member.id);
            self.peer_gone(member.id, member.to_raw(), false);
        }
        dead.len()
    }
}

fn signal_pid(pid: i32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) takes plain integers and has no memory effects.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
