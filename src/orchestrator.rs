//! End-to-end run.
//!
//! `Init -> TargetOpened -> ActorSpawned -> CapacityForced -> AwaitingActor -> Done`
//!
//! The run never returns before the actor has finished: with a shared table
//! the parent's teardown would pull descriptors out from under it. A failed
//! growth phase still releases and waits for the actor before reporting.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;

use crate::allocator::DescriptorAllocator;
use crate::config::HarnessConfig;
use crate::error::HarnessError;
use crate::observation::{self, Observation, TargetCheck};
use crate::oracle::{TableOracle, TableSnapshot};
use crate::spawner::{self, ActorReport, ActorTask};
use crate::sync::Gate;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    TargetOpened,
    ActorSpawned,
    CapacityForced,
    AwaitingActor,
    Done,
}

/// Everything observed by the parent during a completed run.
#[derive(Debug)]
pub struct RunSummary {
    /// Parent snapshots, before and after the growth phase.
    pub snapshots: Vec<TableSnapshot>,
    pub actor: ActorReport,
    pub target: Option<TargetCheck>,
}

pub struct Orchestrator {
    config: HarnessConfig,
    oracle: Option<Arc<dyn TableOracle>>,
    phase: Phase,
}

impl Orchestrator {
    /// `oracle` is `None` in degraded mode: the run proceeds unverified.
    pub fn new(config: HarnessConfig, oracle: Option<Arc<dyn TableOracle>>) -> Self {
        Orchestrator {
            config,
            oracle,
            phase: Phase::Init,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn advance(&mut self, next: Phase) {
        log::debug!("{:?} -> {:?}", self.phase, next);
        self.phase = next;
    }

    fn snapshot(&self, label: &str) -> Option<TableSnapshot> {
        let oracle = self.oracle.as_ref()?;
        match oracle.snapshot(label) {
            Ok(snap) => {
                observation::emit(&Observation::Snapshot(snap.clone()));
                Some(snap)
            }
            Err(e) => {
                log::warn!("snapshot {} skipped: {}", label, e);
                None
            }
        }
    }

    pub fn run(&mut self) -> Result<RunSummary, HarnessError> {
        let cfg = self.config.clone();

        let target = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&cfg.target)
            .map_err(|source| HarnessError::Open {
                index: None,
                path: cfg.target.clone(),
                source,
            })?;
        self.advance(Phase::TargetOpened);

        let gate = Gate::new(cfg.sync).map_err(|source| HarnessError::Spawn {
            mode: cfg.mode,
            source,
        })?;
        let gate = Arc::new(gate);
        let task = ActorTask {
            target_fd: target.as_raw_fd(),
            target_path: cfg.target.clone(),
            payload: Arc::clone(&cfg.payload),
            oracle: self.oracle.clone(),
            gate: Arc::clone(&gate),
        };
        let actor = spawner::spawn(cfg.mode, &task)?;
        self.advance(Phase::ActorSpawned);

        let mut snapshots = Vec::new();
        snapshots.extend(self.snapshot("0"));

        log::info!(
            "parent pid {} opening {} file descriptors",
            std::process::id(),
            cfg.count
        );
        let forced = DescriptorAllocator::new(&cfg.filler).open_n(cfg.count);
        match &forced {
            Ok(()) => {
                snapshots.extend(self.snapshot("1"));
                self.advance(Phase::CapacityForced);
            }
            Err(e) => log::error!("{}; letting the {} actor finish", e, cfg.mode),
        }

        if let Err(e) = gate.release() {
            log::error!("releasing the actor failed: {}", e);
        }
        self.advance(Phase::AwaitingActor);

        let actor_pid = actor.pid();
        let report = actor.wait()?;
        observation::emit(&Observation::Actor {
            pid: actor_pid,
            exit: report.exit,
        });
        if !report.succeeded() {
            log::warn!("{} actor did not complete its write: {:?}", cfg.mode, report);
        }
        forced?;

        let check = match read_back(&cfg.target, &cfg.payload) {
            Ok(Some(check)) => {
                observation::emit(&Observation::Target(check.clone()));
                Some(check)
            }
            Ok(None) => {
                log::info!("{} is not a regular file, skipping read-back", cfg.target.display());
                None
            }
            Err(e) => {
                log::warn!("could not read back {}: {}", cfg.target.display(), e);
                None
            }
        };

        self.advance(Phase::Done);
        observation::emit(&Observation::Done {
            mode: cfg.mode,
            count: cfg.count,
        });
        drop(target);

        Ok(RunSummary {
            snapshots,
            actor: report,
            target: check,
        })
    }
}

/// Compare a regular file's content with `payload`, reading at most one
/// byte more than the payload. Devices and other special files are skipped.
fn read_back(path: &Path, payload: &[u8]) -> io::Result<Option<TargetCheck>> {
    let meta = fs::metadata(path)?;
    if !meta.is_file() {
        return Ok(None);
    }
    let mut head = Vec::with_capacity(payload.len() + 1);
    File::open(path)?
        .take(payload.len() as u64 + 1)
        .read_to_end(&mut head)?;
    Ok(Some(TargetCheck {
        bytes: meta.len() as usize,
        matches: head == payload,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spawner::{ActorExit, ActorMode};

    #[test]
    fn co_thread_run_without_oracle_completes() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = HarnessConfig::new(ActorMode::CoThread, dir.path().join("target"));
        cfg.count = 4;

        let mut orch = Orchestrator::new(cfg, None);
        assert_eq!(orch.phase(), Phase::Init);
        let summary = orch.run().unwrap();

        assert_eq!(orch.phase(), Phase::Done);
        assert!(summary.snapshots.is_empty());
        assert_eq!(summary.actor.exit, ActorExit::Returned);
        assert_eq!(summary.actor.probe.as_ref().unwrap().written, 15);
        assert_eq!(summary.target, Some(TargetCheck { bytes: 15, matches: true }));
    }

    #[test]
    fn device_target_skips_read_back() {
        let mut cfg = HarnessConfig::new(ActorMode::CoThread, "/dev/zero");
        cfg.count = 0;
        let mut orch = Orchestrator::new(cfg, None);
        let summary = orch.run().unwrap();
        assert_eq!(orch.phase(), Phase::Done);
        assert!(summary.actor.succeeded());
        assert_eq!(summary.target, None);
    }

    #[test]
    fn read_back_is_bounded_by_the_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target");

        fs::write(&path, b"testdata write\n").unwrap();
        let check = read_back(&path, b"testdata write\n").unwrap().unwrap();
        assert_eq!(check, TargetCheck { bytes: 15, matches: true });

        fs::write(&path, vec![b'x'; 1 << 20]).unwrap();
        let check = read_back(&path, b"testdata write\n").unwrap().unwrap();
        assert_eq!(check, TargetCheck { bytes: 1 << 20, matches: false });

        fs::write(&path, b"testdata write\nmore").unwrap();
        assert!(!read_back(&path, b"testdata write\n").unwrap().unwrap().matches);

        assert_eq!(read_back(Path::new("/dev/null"), b"x").unwrap(), None);
    }

    #[test]
    fn unopenable_target_aborts_before_spawn() {
        let cfg = HarnessConfig::new(ActorMode::CoThread, "/nonexistent/dir/target");
        let mut orch = Orchestrator::new(cfg, None);
        match orch.run() {
            Err(HarnessError::Open { index: None, .. }) => {}
            other => panic!("expected target open error, got {:?}", other),
        }
        assert_eq!(orch.phase(), Phase::Init);
    }

    #[test]
    fn failed_growth_still_waits_for_the_actor() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = HarnessConfig::new(ActorMode::CoThread, dir.path().join("target"));
        cfg.filler = dir.path().join("missing-filler");

        let mut orch = Orchestrator::new(cfg, None);
        match orch.run() {
            Err(HarnessError::Open { index: Some(0), .. }) => {}
            other => panic!("expected filler open error, got {:?}", other),
        }
        assert_eq!(orch.phase(), Phase::AwaitingActor);
        // The actor ran to completion before the error surfaced.
        assert_eq!(fs::read(dir.path().join("target")).unwrap(), b"testdata write\n");
    }
}
