//! Write probe: pushes a fixed payload through a descriptor number that was
//! established before the actor was spawned.
//!
//! The descriptor is addressed by number only. If that number no longer
//! resolves to the target in the caller's table after growth, the probe
//! fails (or lands in the wrong file, which the target check catches).

use std::io;
use std::os::fd::RawFd;

use crate::error::WriteError;

/// Payload written by every actor.
pub const DEFAULT_PAYLOAD: &[u8] = b"testdata write\n";

/// Consecutive zero-length writes tolerated before giving up.
pub const MAX_ZERO_WRITES: u32 = 1024;

/// Write `payload` to `fd`, accumulating partial writes.
///
/// Returns the total written, which equals `payload.len()`. On failure the
/// error records how far the write got.
pub fn write_payload(fd: RawFd, payload: &[u8]) -> Result<usize, WriteError> {
    let mut written = 0usize;
    let mut zero_writes = 0u32;

    while written < payload.len() {
        let rest = &payload[written..];
        let r = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };

        if r > 0 {
            written += r as usize;
            zero_writes = 0;
            continue;
        }

        if r == 0 {
            zero_writes += 1;
            if zero_writes >= MAX_ZERO_WRITES {
                return Err(WriteError {
                    written,
                    source: io::Error::from(io::ErrorKind::WriteZero),
                });
            }
            continue;
        }

        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock => continue,
            _ => return Err(WriteError { written, source: err }),
        }
    }

    Ok(written)
}
