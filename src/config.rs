//! Run configuration.
//!
//! One explicit structure handed to every component, built and validated
//! from the command line before anything is opened.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::LevelFilter;

use crate::allocator::{DEFAULT_FILLER, DEFAULT_PRESSURE};
use crate::error::{cvt, HarnessError};
use crate::probe::DEFAULT_PAYLOAD;
use crate::spawner::ActorMode;
use crate::sync::SyncStrategy;

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub mode: ActorMode,
    /// File opened (created, truncated) before the actor is spawned.
    pub target: PathBuf,
    /// Descriptors opened by the parent to force growth.
    pub count: usize,
    pub filler: PathBuf,
    pub sync: SyncStrategy,
    pub payload: Arc<[u8]>,
    /// Durable log shared by the parent and every actor.
    pub log_file: PathBuf,
    pub console_level: LevelFilter,
}

impl HarnessConfig {
    /// Configuration with the historical defaults for `mode` and `target`.
    pub fn new(mode: ActorMode, target: impl Into<PathBuf>) -> Self {
        HarnessConfig {
            mode,
            target: target.into(),
            count: DEFAULT_PRESSURE,
            filler: PathBuf::from(DEFAULT_FILLER),
            sync: SyncStrategy::default(),
            payload: Arc::from(DEFAULT_PAYLOAD),
            log_file: default_log_file(),
            console_level: LevelFilter::Warn,
        }
    }

    /// Pre-flight checks that need no open resources.
    pub fn validate(&self) -> Result<(), HarnessError> {
        if self.target.as_os_str().is_empty() {
            return Err(HarnessError::Argument("filename required".into()));
        }
        let limit = nofile_limit().map_err(|e| {
            HarnessError::Argument(format!("getrlimit(RLIMIT_NOFILE) failed: {}", e))
        })?;
        check_pressure(self.count, limit)
    }
}

/// `$TMPDIR/fdgrow-<pid>.log`
pub fn default_log_file() -> PathBuf {
    std::env::temp_dir().join(format!("fdgrow-{}.log", std::process::id()))
}

/// Soft `RLIMIT_NOFILE` of the calling process.
pub fn nofile_limit() -> io::Result<u64> {
    let mut lim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    cvt(unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut lim) })?;
    Ok(lim.rlim_cur as u64)
}

pub fn check_pressure(count: usize, limit: u64) -> Result<(), HarnessError> {
    if count as u64 > limit {
        return Err(HarnessError::ResourceLimit {
            requested: count as u64,
            limit,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_historical_run() {
        let cfg = HarnessConfig::new(ActorMode::Copy, "/tmp/t");
        assert_eq!(cfg.count, 61);
        assert_eq!(&*cfg.payload, b"testdata write\n");
        assert_eq!(cfg.sync, SyncStrategy::Rendezvous);
        assert!(cfg
            .log_file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("fdgrow-"));
        cfg.validate().unwrap();
    }

    #[test]
    fn pressure_above_limit_is_rejected() {
        check_pressure(1024, 1024).unwrap();
        match check_pressure(1025, 1024) {
            Err(HarnessError::ResourceLimit { requested, limit }) => {
                assert_eq!((requested, limit), (1025, 1024));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn empty_target_is_an_argument_error() {
        let cfg = HarnessConfig::new(ActorMode::Share, "");
        assert!(matches!(cfg.validate(), Err(HarnessError::Argument(_))));
    }

    #[test]
    fn rlimit_is_readable() {
        assert!(nofile_limit().unwrap() >= 3);
    }
}
