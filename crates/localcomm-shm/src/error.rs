use shared_memory::ShmemError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegmentError {
    #[error("segment name already exists")]
    AlreadyExists,
    #[error("segment does not exist")]
    NotFound,
    #[error("no space for a segment of {0} bytes")]
    NoSpace(usize),
    #[error("capacity {0} is below the 8 byte segment header")]
    CapacityTooSmall(usize),
    #[error("payload of {payload} bytes exceeds segment capacity {capacity}")]
    TooLarge { payload: usize, capacity: usize },
    #[error("corrupt segment header: claims {claimed} bytes in a {capacity} byte segment")]
    Corrupt { claimed: usize, capacity: usize },
    #[error("shared memory error")]
    Shmem(#[from] ShmemError),
}
