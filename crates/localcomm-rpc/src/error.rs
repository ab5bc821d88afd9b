use std::io;

use localcomm_shm::SegmentError;
use localcomm_utils::NameError;
use thiserror::Error;

use crate::uds::WireError;

/// Everything a call or a registration can fail with.
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("service `{0}` not found")]
    NotFound(String),
    #[error("transport failure: {0}")]
    Transport(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("remote handler failed: {0}")]
    Remote(String),
    #[error("service `{0}` already registered")]
    AddressInUse(String),
    #[error(transparent)]
    Segment(#[from] SegmentError),
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::PeerClosed => Self::Transport(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection mid-frame",
            )),
            WireError::Protocol(msg) => Self::Protocol(msg),
            WireError::Io(err) => Self::Transport(err),
        }
    }
}

impl From<NameError> for RpcError {
    fn from(err: NameError) -> Self {
        Self::Protocol(err.to_string())
    }
}
