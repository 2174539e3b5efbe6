//! Parent/actor ordering.
//!
//! The actor must not observe the table until the parent has finished
//! forcing growth. `FixedDelay` sleeps and hopes; `Rendezvous` blocks the
//! actor on a pipe the parent writes to once it is done.
//!
//! A process actor keeps the pipe's write end alive itself (its own copy
//! after `fork`, the shared table after `clone`), so end-of-file cannot tell
//! it that the parent died. The wait therefore polls, and gives up once the
//! actor has been reparented away from the process that created the gate.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crate::error::cvt;

/// Historical head start given to the parent before the actor proceeds.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(3);

/// How often a waiting actor checks that its parent is still there.
const ORPHAN_POLL_MS: libc::c_int = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStrategy {
    /// Sleep, then proceed whether or not the parent is done. Race-prone.
    FixedDelay(Duration),
    /// Block until the parent releases the gate.
    #[default]
    Rendezvous,
}

/// One-shot release from the parent to a single actor.
///
/// Created before the actor is spawned so every sharing mode sees the same
/// pipe: a forked copy, a shared table, or the same process.
pub struct Gate {
    strategy: SyncStrategy,
    pipe: Option<(File, File)>,
    released: AtomicBool,
    /// Process that created the gate and is the only one to release it.
    owner: libc::pid_t,
}

impl Gate {
    pub fn new(strategy: SyncStrategy) -> io::Result<Gate> {
        let pipe = match strategy {
            SyncStrategy::FixedDelay(delay) => {
                log::warn!(
                    "fixed {:?} delay orders parent and actor on a best-effort basis only",
                    delay
                );
                None
            }
            SyncStrategy::Rendezvous => {
                let mut fds = [0; 2];
                cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
                let (rx, tx) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
                Some((rx, tx))
            }
        };
        Ok(Gate {
            strategy,
            pipe,
            released: AtomicBool::new(false),
            owner: unsafe { libc::getpid() },
        })
    }

    /// Parent side: let the actor proceed. Only the first call has an effect.
    pub fn release(&self) -> io::Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some((_, tx)) = &self.pipe {
            (&*tx).write_all(&[1])?;
        }
        Ok(())
    }

    /// The caller is a child of the owner, and the owner has exited.
    fn orphaned(&self) -> bool {
        unsafe { libc::getpid() != self.owner && libc::getppid() != self.owner }
    }

    /// Actor side: block until released.
    ///
    /// End-of-file counts as a release. A process actor whose parent exits
    /// without releasing gets `BrokenPipe` instead of blocking forever.
    pub fn wait(&self) -> io::Result<()> {
        match (&self.strategy, &self.pipe) {
            (SyncStrategy::FixedDelay(delay), _) => {
                thread::sleep(*delay);
                Ok(())
            }
            (SyncStrategy::Rendezvous, Some((rx, _))) => {
                let mut pfd = libc::pollfd {
                    fd: rx.as_raw_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                };
                loop {
                    let ready = unsafe { libc::poll(&mut pfd, 1, ORPHAN_POLL_MS) };
                    if ready < 0 {
                        let err = io::Error::last_os_error();
                        if err.kind() == io::ErrorKind::Interrupted {
                            continue;
                        }
                        return Err(err);
                    }
                    if ready > 0 {
                        break;
                    }
                    if self.orphaned() {
                        return Err(io::Error::new(
                            io::ErrorKind::BrokenPipe,
                            format!("parent {} exited before releasing the actor", self.owner),
                        ));
                    }
                }

                let mut byte = [0u8; 1];
                loop {
                    match (&*rx).read(&mut byte) {
                        Ok(_) => return Ok(()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
            (SyncStrategy::Rendezvous, None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn rendezvous_blocks_until_release() {
        let gate = Arc::new(Gate::new(SyncStrategy::Rendezvous).unwrap());
        let (tx, rx) = mpsc::channel();

        let waiter = {
            let gate = Arc::clone(&gate);
            thread::spawn(move || {
                gate.wait().unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        gate.release().unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn release_is_one_shot() {
        let gate = Gate::new(SyncStrategy::Rendezvous).unwrap();
        gate.release().unwrap();
        gate.release().unwrap();
        gate.wait().unwrap();
        assert!(gate.released.load(Ordering::Acquire));
    }

    #[test]
    fn orphaned_actor_stops_waiting() {
        let mut gate = Gate::new(SyncStrategy::Rendezvous).unwrap();
        // Neither this process nor its parent: the owner is gone.
        gate.owner = -1;
        let start = Instant::now();
        let err = gate.wait().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn owner_never_counts_as_orphaned() {
        let gate = Gate::new(SyncStrategy::Rendezvous).unwrap();
        assert!(!gate.orphaned());
    }

    #[test]
    fn fixed_delay_sleeps_without_release() {
        let gate = Gate::new(SyncStrategy::FixedDelay(Duration::from_millis(50))).unwrap();
        let start = Instant::now();
        gate.wait().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
