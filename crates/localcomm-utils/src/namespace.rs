use std::{
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
};

use thiserror::Error;

use crate::directories::runtime_dir;

/// Longest accepted service name, in bytes.
pub const MAX_SERVICE_NAME: usize = 96;

/// Prefix shared by every socket file and segment name the transport creates.
const NAME_PREFIX: &str = "lc-";

/// Monotonic per-process counter suffixing segment names. Combined with the
/// pid this keeps names unique across every process using the transport.
static NEXT_SEGMENT: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameError {
    #[error("service name is empty")]
    Empty,
    #[error("service name is {0} bytes, limit is {MAX_SERVICE_NAME}")]
    TooLong(usize),
    #[error("service name contains a path separator")]
    PathSeparator,
    #[error("service name contains non-printable byte {0:#04x}")]
    NotPrintable(u8),
}

/// A service name must be printable ASCII, non-empty, at most
/// [`MAX_SERVICE_NAME`] bytes and free of path separators, so that it maps
/// onto a socket filename and a shm object name without escaping either
/// namespace.
pub fn validate_service_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() {
        return Err(NameError::Empty);
    }
    if name.len() > MAX_SERVICE_NAME {
        return Err(NameError::TooLong(name.len()));
    }
    for b in name.bytes() {
        if b == b'/' {
            return Err(NameError::PathSeparator);
        }
        if !b.is_ascii_graphic() && b != b' ' {
            return Err(NameError::NotPrintable(b));
        }
    }
    Ok(())
}

/// Well-known socket path owned by a service.
pub fn socket_path(service: &str) -> PathBuf {
    runtime_dir().join(format!("{NAME_PREFIX}{service}.sock"))
}

/// Fresh shared-memory object name for one payload handoff.
/// The leading slash is required by POSIX `shm_open`.
pub fn segment_name(service: &str) -> String {
    let seq = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    format!("/{NAME_PREFIX}{service}-{}-{seq}", std::process::id())
}
