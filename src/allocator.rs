//! Descriptor pressure.
//!
//! Opens throwaway descriptors against a filler file until the table has to
//! grow. The descriptors are never used or closed; they exist only to occupy
//! slots for the rest of the process's life.

use std::fs::File;
use std::os::fd::IntoRawFd;
use std::path::PathBuf;

use crate::error::HarnessError;

/// Default pressure count: enough, with stdio and the target, to push a
/// 64-slot table past its inline capacity.
pub const DEFAULT_PRESSURE: usize = 61;

/// Default filler resource. Readable everywhere.
pub const DEFAULT_FILLER: &str = "/dev/null";

pub struct DescriptorAllocator {
    filler: PathBuf,
}

impl DescriptorAllocator {
    pub fn new(filler: impl Into<PathBuf>) -> Self {
        DescriptorAllocator {
            filler: filler.into(),
        }
    }

    /// Open `count` read-only descriptors on the filler.
    ///
    /// Stops at the first failure; descriptors opened before it stay open.
    pub fn open_n(&self, count: usize) -> Result<(), HarnessError> {
        for index in 0..count {
            let file = File::open(&self.filler).map_err(|source| HarnessError::Open {
                index: Some(index),
                path: self.filler.clone(),
                source,
            })?;
            let fd = file.into_raw_fd();
            log::trace!("filler #{} -> fd {}", index, fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_count_opens_nothing() {
        // Would fail on the first open if any were attempted.
        let alloc = DescriptorAllocator::new("/nonexistent/fdgrow-filler");
        alloc.open_n(0).unwrap();
    }

    #[test]
    fn missing_filler_reports_first_index() {
        let alloc = DescriptorAllocator::new("/nonexistent/fdgrow-filler");
        match alloc.open_n(4) {
            Err(HarnessError::Open {
                index: Some(0),
                path,
                source,
            }) => {
                assert_eq!(path, PathBuf::from("/nonexistent/fdgrow-filler"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected open error at index 0, got {:?}", other),
        }
    }
}
