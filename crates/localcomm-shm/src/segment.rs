use std::{ffi::CString, io};

use localcomm_utils::segment_name;
use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::warn;

use crate::error::SegmentError;

/// Bytes reserved at the front of every segment for the payload length
/// prefix, a little-endian u64.
pub const HEADER_SIZE: usize = 8;

/// Fresh names to try in [`Segment::allocate`] before giving up.
const ALLOC_RETRIES: usize = 8;

/// One named shared-memory object carrying a single length-prefixed payload.
///
/// The length prefix, rather than the mapping size, bounds the payload so the
/// same segment can carry a request and a differently sized reply, and can be
/// provisioned with slack.
///
/// Dropping a `Segment` unmaps it. The name is never removed implicitly:
/// whichever side created the object calls [`Segment::unlink`] once the peer
/// has finished mapping it.
pub struct Segment {
    shmem: Shmem,
    name: String,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment").field("name", &self.name).finish()
    }
}

impl Segment {
    /// Creates a new shared-memory object of exactly `capacity` bytes under
    /// `name`.
    pub fn create(name: &str, capacity: usize) -> Result<Self, SegmentError> {
        if capacity < HEADER_SIZE {
            return Err(SegmentError::CapacityTooSmall(capacity));
        }
        match ShmemConf::new().os_id(name).size(capacity).create() {
            Ok(mut shmem) => {
                // Keep unlink an explicit protocol step, not a drop side
                // effect.
                shmem.set_owner(false);
                Ok(Self { shmem, name: name.to_string() })
            }
            Err(ShmemError::MappingIdExists) => Err(SegmentError::AlreadyExists),
            Err(ShmemError::MapCreateFailed(errno) | ShmemError::UnknownOsError(errno))
                if errno == libc::ENOSPC as u32 || errno == libc::ENOMEM as u32 =>
            {
                Err(SegmentError::NoSpace(capacity))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Creates a segment under a fresh `/lc-<service>-<pid>-<seq>` name,
    /// moving on to the next counter value when a stale object already
    /// occupies one.
    pub fn allocate(service: &str, capacity: usize) -> Result<Self, SegmentError> {
        for _ in 0..ALLOC_RETRIES {
            match Self::create(&segment_name(service), capacity) {
                Err(SegmentError::AlreadyExists) => {}
                other => return other,
            }
        }
        Err(SegmentError::AlreadyExists)
    }

    /// Maps an existing object read/write.
    pub fn open(name: &str) -> Result<Self, SegmentError> {
        match ShmemConf::new().os_id(name).open() {
            Ok(mut shmem) => {
                shmem.set_owner(false);
                Ok(Self { shmem, name: name.to_string() })
            }
            Err(ShmemError::MapOpenFailed(errno)) if errno == libc::ENOENT as u32 => {
                Err(SegmentError::NotFound)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mapped size in bytes, header included.
    pub fn capacity(&self) -> usize {
        self.shmem.len()
    }

    /// Stores the length prefix, then copies `payload` in behind it.
    pub fn write_payload(&mut self, payload: &[u8]) -> Result<(), SegmentError> {
        let capacity = self.capacity();
        if payload.len() > capacity - HEADER_SIZE {
            return Err(SegmentError::TooLarge { payload: payload.len(), capacity });
        }
        let base = self.shmem.as_ptr();
        unsafe {
            std::ptr::copy_nonoverlapping(
                (payload.len() as u64).to_le_bytes().as_ptr(),
                base,
                HEADER_SIZE,
            );
            std::ptr::copy_nonoverlapping(payload.as_ptr(), base.add(HEADER_SIZE), payload.len());
        }
        Ok(())
    }

    /// Copies the current payload out.
    pub fn read_payload(&self) -> Result<Vec<u8>, SegmentError> {
        let capacity = self.capacity();
        let base = self.shmem.as_ptr();
        let mut prefix = [0u8; HEADER_SIZE];
        unsafe { std::ptr::copy_nonoverlapping(base, prefix.as_mut_ptr(), HEADER_SIZE) };
        let claimed = u64::from_le_bytes(prefix) as usize;
        if claimed > capacity - HEADER_SIZE {
            return Err(SegmentError::Corrupt { claimed, capacity });
        }
        let mut payload = vec![0u8; claimed];
        unsafe {
            std::ptr::copy_nonoverlapping(base.add(HEADER_SIZE), payload.as_mut_ptr(), claimed);
        }
        Ok(payload)
    }

    /// Removes `name` from the OS namespace. Idempotent; a missing name is
    /// not an error.
    pub fn unlink(name: &str) {
        let Ok(cname) = CString::new(name) else {
            return;
        };
        if unsafe { libc::shm_unlink(cname.as_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOENT) {
                warn!(name, ?err, "shm unlink failed");
            }
        }
    }
}
