//! Unified error type for harness operations.
//!
//! Every fallible step of a run returns `Result<T, HarnessError>`. Pre-flight
//! errors (arguments, resource limits) are raised before anything is opened;
//! the rest carry the underlying OS error as their source.

use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::spawner::ActorMode;

/// Exit status for argument and resource-limit failures.
pub const EXIT_PREFLIGHT: i32 = 2;
/// Exit status for failures after pre-flight validation passed.
pub const EXIT_FATAL: i32 = 1;

/// A probe write that stopped before the whole payload was written.
#[derive(Debug)]
pub struct WriteError {
    /// Bytes accepted before the failure. Always less than the payload length.
    pub written: usize,
    pub source: io::Error,
}

impl WriteError {
    /// Raw errno of the failure, if the source came from the OS.
    pub fn errno(&self) -> Option<i32> {
        self.source.raw_os_error()
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "write failed after {} bytes: {}", self.written, self.source)
    }
}

impl std::error::Error for WriteError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

#[derive(Debug)]
pub enum HarnessError {
    /// Malformed, missing or conflicting command-line input.
    Argument(String),
    /// Requested descriptor pressure exceeds `RLIMIT_NOFILE`.
    ResourceLimit { requested: u64, limit: u64 },
    /// The target (`index == None`) or the `index`th filler descriptor could not be opened.
    Open {
        index: Option<usize>,
        path: PathBuf,
        source: io::Error,
    },
    /// The actor could not be created.
    Spawn { mode: ActorMode, source: io::Error },
    /// No table-state introspection is available on this system.
    OracleUnavailable(String),
}

impl HarnessError {
    /// Process exit status for this error when it aborts a run.
    pub fn exit_code(&self) -> i32 {
        match self {
            HarnessError::Argument(_) | HarnessError::ResourceLimit { .. } => EXIT_PREFLIGHT,
            _ => EXIT_FATAL,
        }
    }

    /// Whether the error is raised before any resource is opened.
    pub fn is_preflight(&self) -> bool {
        self.exit_code() == EXIT_PREFLIGHT
    }
}

impl fmt::Display for HarnessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HarnessError::Argument(msg) => write!(f, "invalid arguments: {}", msg),
            HarnessError::ResourceLimit { requested, limit } => write!(
                f,
                "number of open files ({}) exceeds RLIMIT_NOFILE ({})",
                requested, limit
            ),
            HarnessError::Open {
                index: None,
                path,
                source,
            } => write!(f, "open() of target {} failed: {}", path.display(), source),
            HarnessError::Open {
                index: Some(i),
                path,
                source,
            } => write!(
                f,
                "open() of filler {} failed at descriptor #{}: {}",
                path.display(),
                i,
                source
            ),
            HarnessError::Spawn { mode, source } => {
                write!(f, "spawning {} actor failed: {}", mode, source)
            }
            HarnessError::OracleUnavailable(why) => {
                write!(f, "table-state oracle unavailable: {}", why)
            }
        }
    }
}

impl std::error::Error for HarnessError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HarnessError::Open { source, .. } | HarnessError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Convert a libc return value to `io::Result`, reading `errno` on `-1`.
#[inline]
pub(crate) fn cvt<T: PartialEq + From<i8>>(ret: T) -> io::Result<T> {
    if ret == T::from(-1) {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_errors_use_their_own_exit_code() {
        assert_eq!(HarnessError::Argument("x".into()).exit_code(), EXIT_PREFLIGHT);
        let limit = HarnessError::ResourceLimit {
            requested: 5000,
            limit: 1024,
        };
        assert!(limit.is_preflight());
        assert!(limit.to_string().contains("5000"));

        let open = HarnessError::Open {
            index: Some(3),
            path: PathBuf::from("/dev/null"),
            source: io::Error::from_raw_os_error(libc::EMFILE),
        };
        assert_eq!(open.exit_code(), EXIT_FATAL);
        assert!(open.to_string().contains("#3"));
    }

    #[test]
    fn cvt_maps_minus_one_to_errno() {
        assert_eq!(cvt(5i32).unwrap(), 5);
        assert!(cvt(-1i32).is_err());
        assert!(cvt(-1isize).is_err());
    }
}
