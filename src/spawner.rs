//! Actor creation in the three sharing modes.
//!
//! - `Copy`: `fork(2)`; the child owns a copy of the parent's table.
//! - `Share`: `clone(2)` with `CLONE_FILES`; a separate process attached to
//!   the parent's table.
//! - `CoThread`: a thread of this process, sharing its only table.
//!
//! Every actor runs the same [`ActorTask`]: wait at the gate, snapshot,
//! probe the pre-existing descriptor, report.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::error::{cvt, HarnessError};
use crate::observation::{self, Observation, ProbeRecord};
use crate::oracle::{ContextId, TableOracle};
use crate::probe;
use crate::sync::Gate;

/// Exit status of a process actor whose probe failed.
pub const EXIT_PROBE_FAILED: i32 = 1;
/// Exit status of a process actor that panicked.
pub const EXIT_PANICKED: i32 = 101;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorMode {
    Copy,
    Share,
    CoThread,
}

impl ActorMode {
    pub const ALL: [ActorMode; 3] = [ActorMode::Copy, ActorMode::Share, ActorMode::CoThread];

    pub fn label(&self) -> &'static str {
        match self {
            ActorMode::Copy => "copy",
            ActorMode::Share => "share",
            ActorMode::CoThread => "co-thread",
        }
    }

    /// Command-line flag selecting this mode.
    pub fn flag(&self) -> &'static str {
        match self {
            ActorMode::Copy => "--copy",
            ActorMode::Share => "--share",
            ActorMode::CoThread => "--co-thread",
        }
    }

    /// The actor is attached to the parent's table rather than a copy.
    pub fn shares_table(&self) -> bool {
        !matches!(self, ActorMode::Copy)
    }
}

impl fmt::Display for ActorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ActorMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActorMode::ALL
            .into_iter()
            .find(|m| m.label() == s)
            .ok_or_else(|| format!("unknown mode: {}", s))
    }
}

/// How an actor finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorExit {
    /// Process actor exited with this status.
    Exited(i32),
    /// Process actor was killed by this signal.
    Signaled(i32),
    /// Thread actor returned.
    Returned,
    /// Thread actor panicked.
    Panicked,
}

impl ActorExit {
    pub fn is_clean(&self) -> bool {
        matches!(self, ActorExit::Exited(0) | ActorExit::Returned)
    }
}

impl fmt::Display for ActorExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorExit::Exited(code) => write!(f, "exited:{}", code),
            ActorExit::Signaled(sig) => write!(f, "signaled:{}", sig),
            ActorExit::Returned => f.write_str("returned"),
            ActorExit::Panicked => f.write_str("panicked"),
        }
    }
}

impl FromStr for ActorExit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let num = |v: &str| v.parse::<i32>().map_err(|_| format!("bad actor exit: {}", s));
        match s.split_once(':') {
            Some(("exited", v)) => Ok(ActorExit::Exited(num(v)?)),
            Some(("signaled", v)) => Ok(ActorExit::Signaled(num(v)?)),
            None if s == "returned" => Ok(ActorExit::Returned),
            None if s == "panicked" => Ok(ActorExit::Panicked),
            _ => Err(format!("bad actor exit: {}", s)),
        }
    }
}

/// What the parent learns once an actor is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorReport {
    /// Process id of the actor (the parent's own for a co-thread).
    pub pid: i32,
    pub exit: ActorExit,
    /// `None` if the actor died before reporting.
    pub probe: Option<ProbeRecord>,
}

impl ActorReport {
    pub fn succeeded(&self) -> bool {
        self.exit.is_clean() && self.probe.as_ref().is_some_and(|p| p.succeeded())
    }
}

/// The work every actor does, whatever its sharing mode.
#[derive(Clone)]
pub struct ActorTask {
    /// Descriptor number opened by the parent before the spawn.
    pub target_fd: RawFd,
    pub target_path: PathBuf,
    pub payload: Arc<[u8]>,
    pub oracle: Option<Arc<dyn TableOracle>>,
    pub gate: Arc<Gate>,
}

impl ActorTask {
    pub fn run(&self) -> ProbeRecord {
        let context = ContextId::current();

        if let Err(e) = self.gate.wait() {
            log::warn!("actor {}: gate wait failed ({}), proceeding", context, e);
        }

        if let Some(oracle) = &self.oracle {
            match oracle.snapshot("actor") {
                Ok(snap) => observation::emit(&Observation::Snapshot(snap)),
                Err(e) => log::warn!("actor {}: snapshot failed: {}", context, e),
            }
        }

        log::info!(
            "actor {} testing write to file {} through fd {}",
            context,
            self.target_path.display(),
            self.target_fd
        );

        let record = match probe::write_payload(self.target_fd, &self.payload) {
            Ok(written) => {
                log::info!("actor {} successfully wrote {} bytes", context, written);
                ProbeRecord { context, written, error: None }
            }
            Err(e) => {
                log::error!("actor {}: {}", context, e);
                ProbeRecord {
                    context,
                    written: e.written,
                    error: Some(e.errno()),
                }
            }
        };
        observation::emit(&Observation::Probe(record.clone()));
        record
    }
}

/// A running actor. Must be waited on before the parent's resources go away.
#[must_use = "an actor must be waited for before the run ends"]
pub enum ActorHandle {
    Process {
        mode: ActorMode,
        pid: libc::pid_t,
        report_rx: File,
        /// Held until the wait: with a shared table, closing it here would
        /// close it under the child too.
        report_tx: File,
    },
    Thread(JoinHandle<ProbeRecord>),
}

impl ActorHandle {
    pub fn pid(&self) -> i32 {
        match self {
            ActorHandle::Process { pid, .. } => *pid,
            ActorHandle::Thread(_) => unsafe { libc::getpid() },
        }
    }

    /// Block until the actor has finished and collect its report.
    pub fn wait(self) -> Result<ActorReport, HarnessError> {
        match self {
            ActorHandle::Thread(handle) => {
                let pid = unsafe { libc::getpid() };
                Ok(match handle.join() {
                    Ok(probe) => ActorReport {
                        pid,
                        exit: ActorExit::Returned,
                        probe: Some(probe),
                    },
                    Err(_) => ActorReport {
                        pid,
                        exit: ActorExit::Panicked,
                        probe: None,
                    },
                })
            }
            ActorHandle::Process {
                mode,
                pid,
                report_rx,
                report_tx,
            } => {
                let exit = wait_pid(pid).map_err(|source| HarnessError::Spawn { mode, source })?;
                // The write end may be shared with the (now gone) child's
                // table, so no EOF is coming; read what is buffered.
                let text = drain_nonblocking(&report_rx)
                    .map_err(|source| HarnessError::Spawn { mode, source })?;
                drop(report_tx);

                let probe = observation::parse_all(&text)
                    .into_iter()
                    .find_map(|obs| match obs {
                        Observation::Probe(p) => Some(p),
                        _ => None,
                    });
                Ok(ActorReport { pid, exit, probe })
            }
        }
    }
}

fn wait_pid(pid: libc::pid_t) -> io::Result<ActorExit> {
    let mut status = 0;
    loop {
        let r = unsafe { libc::waitpid(pid, &mut status, 0) };
        if r == pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    if libc::WIFEXITED(status) {
        Ok(ActorExit::Exited(libc::WEXITSTATUS(status)))
    } else {
        Ok(ActorExit::Signaled(libc::WTERMSIG(status)))
    }
}

fn drain_nonblocking(rx: &File) -> io::Result<String> {
    let fd = rx.as_raw_fd();
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })?;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        match (&*rx).read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn report_pipe() -> io::Result<(File, File)> {
    let mut fds = [0; 2];
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Body of a process actor. Never returns into the parent's code path.
fn child_main(task: &ActorTask, report_tx: &File) -> ! {
    let code = match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(record) => {
            let mut tx = report_tx;
            let _ = writeln!(tx, "{}", Observation::Probe(record.clone()));
            if record.succeeded() {
                0
            } else {
                EXIT_PROBE_FAILED
            }
        }
        Err(_) => EXIT_PANICKED,
    };
    let _ = io::stdout().flush();
    // No destructors or atexit handlers: they belong to the parent.
    unsafe { libc::_exit(code) }
}

fn fork_actor(mode: ActorMode) -> io::Result<libc::pid_t> {
    // Nothing buffered may be duplicated into the child.
    let _ = io::stdout().flush();

    let pid = match mode {
        ActorMode::Copy => unsafe { libc::fork() },
        // Raw clone without a new stack behaves like fork, except that the
        // files table is shared instead of copied. libc's fork handlers do
        // not run; the parent is single-threaded at this point and the child
        // leaves through _exit.
        ActorMode::Share => unsafe {
            libc::syscall(
                libc::SYS_clone,
                (libc::CLONE_FILES | libc::SIGCHLD) as libc::c_ulong,
                0usize,
                0usize,
                0usize,
                0usize,
            ) as libc::pid_t
        },
        ActorMode::CoThread => unreachable!("threads are not forked"),
    };
    cvt(pid)
}

/// Start an actor in `mode` running `task`.
pub fn spawn(mode: ActorMode, task: &ActorTask) -> Result<ActorHandle, HarnessError> {
    let spawn_err = |source| HarnessError::Spawn { mode, source };

    match mode {
        ActorMode::CoThread => {
            let task = task.clone();
            let handle = thread::Builder::new()
                .name("fdgrow-co-thread".into())
                .spawn(move || task.run())
                .map_err(spawn_err)?;
            log::debug!("spawned co-thread actor");
            Ok(ActorHandle::Thread(handle))
        }
        ActorMode::Copy | ActorMode::Share => {
            let (report_rx, report_tx) = report_pipe().map_err(spawn_err)?;
            let pid = fork_actor(mode).map_err(spawn_err)?;
            if pid == 0 {
                child_main(task, &report_tx);
            }
            log::debug!("spawned {} actor pid {}", mode, pid);
            Ok(ActorHandle::Process {
                mode,
                pid,
                report_rx,
                report_tx,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::SyncStrategy;
    use std::fs;
    use std::os::fd::AsRawFd;

    #[test]
    fn mode_labels_round_trip() {
        for mode in ActorMode::ALL {
            assert_eq!(mode.label().parse::<ActorMode>().unwrap(), mode);
            assert!(mode.flag().ends_with(mode.label()));
        }
        assert!("fork".parse::<ActorMode>().is_err());
        assert!(!ActorMode::Copy.shares_table());
        assert!(ActorMode::CoThread.shares_table());
    }

    #[test]
    fn actor_exit_round_trips() {
        for exit in [
            ActorExit::Exited(0),
            ActorExit::Exited(1),
            ActorExit::Signaled(9),
            ActorExit::Returned,
            ActorExit::Panicked,
        ] {
            assert_eq!(exit.to_string().parse::<ActorExit>().unwrap(), exit);
        }
        assert!("exited:x".parse::<ActorExit>().is_err());
        assert!(ActorExit::Returned.is_clean());
        assert!(!ActorExit::Exited(1).is_clean());
    }

    #[test]
    fn co_thread_writes_through_shared_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");
        let target = File::create(&path).unwrap();
        let gate = Arc::new(Gate::new(SyncStrategy::Rendezvous).unwrap());

        let task = ActorTask {
            target_fd: target.as_raw_fd(),
            target_path: path.clone(),
            payload: Arc::from(probe::DEFAULT_PAYLOAD),
            oracle: None,
            gate: Arc::clone(&gate),
        };
        let actor = spawn(ActorMode::CoThread, &task).unwrap();
        gate.release().unwrap();

        let report = actor.wait().unwrap();
        assert!(report.succeeded());
        assert_eq!(report.exit, ActorExit::Returned);
        assert_eq!(report.probe.unwrap().written, probe::DEFAULT_PAYLOAD.len());
        assert_eq!(fs::read(&path).unwrap(), probe::DEFAULT_PAYLOAD);
    }

    #[test]
    fn co_thread_reports_a_failed_write() {
        let read_only = File::open("/dev/null").unwrap();
        let gate = Arc::new(Gate::new(SyncStrategy::Rendezvous).unwrap());
        let task = ActorTask {
            target_fd: read_only.as_raw_fd(),
            target_path: PathBuf::from("/dev/null"),
            payload: Arc::from(probe::DEFAULT_PAYLOAD),
            oracle: None,
            gate: Arc::clone(&gate),
        };
        let actor = spawn(ActorMode::CoThread, &task).unwrap();
        gate.release().unwrap();

        let report = actor.wait().unwrap();
        assert_eq!(report.exit, ActorExit::Returned);
        assert!(!report.succeeded());
        let record = report.probe.unwrap();
        assert_eq!(record.error, Some(Some(libc::EBADF)));
        assert!(record.written < probe::DEFAULT_PAYLOAD.len());
    }
}
