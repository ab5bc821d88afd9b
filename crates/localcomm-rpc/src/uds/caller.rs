use std::{io, os::unix::net::UnixStream, path::PathBuf, time::Duration};

use localcomm_shm::{HEADER_SIZE, Segment};
use localcomm_utils::{socket_path, validate_service_name};
use tracing::debug;

use crate::{
    error::RpcError,
    uds::frame::{ControlFrame, read_frame, write_frame},
};

/// Smallest segment a caller allocates. Small requests get slack so the
/// reply can usually be written back without a second mapping.
pub const MIN_CAPACITY: usize = 64 * 1024;

/// Client-side stub for one named service.
///
/// Every [`call`](Self::call) opens a fresh connection, hands the request
/// over through a shared segment and blocks until the reply has been read
/// back. The stub holds no open resources between calls, so one long-lived
/// stub per service is all a process needs.
#[derive(Debug)]
pub struct ServiceCaller {
    service: String,
    path: PathBuf,
    timeout: Option<Duration>,
}

impl ServiceCaller {
    pub fn new(service: &str) -> Result<Self, RpcError> {
        validate_service_name(service)?;
        Ok(Self { service: service.to_string(), path: socket_path(service), timeout: None })
    }

    /// Bounds every socket read and write of a call. A server that stops
    /// mid-call then surfaces as [`RpcError::Transport`] instead of blocking
    /// forever. Default: no timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Sends `request` to the service and returns its reply.
    ///
    /// Errors are surfaced as-is, without retries: [`RpcError::NotFound`]
    /// when the service socket is missing or refuses, [`RpcError::Remote`]
    /// when the handler failed, [`RpcError::Transport`] for everything that
    /// died mid-exchange.
    pub fn call(&self, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        let capacity = (HEADER_SIZE + request.len()).max(MIN_CAPACITY);
        let mut segment = Segment::allocate(&self.service, capacity)?;
        let reply = self.exchange(&mut segment, request);
        // The request segment is ours to unlink in every outcome.
        Segment::unlink(segment.name());
        reply
    }

    fn exchange(&self, segment: &mut Segment, request: &[u8]) -> Result<Vec<u8>, RpcError> {
        segment.write_payload(request)?;

        let mut stream = self.connect()?;
        write_frame(&mut stream, &ControlFrame::Request {
            segment: segment.name().to_string(),
            capacity: segment.capacity() as u64,
        })?;

        match read_frame(&mut stream)? {
            ControlFrame::Ready => {}
            ControlFrame::Error { message } => return Err(RpcError::Remote(message)),
            other => {
                return Err(RpcError::Protocol(format!("expected READY, got {}", other.tag_name())));
            }
        }

        match read_frame(&mut stream)? {
            ControlFrame::Done { segment: reply_name, .. } => {
                if reply_name == segment.name() {
                    Ok(segment.read_payload()?)
                } else {
                    // The server grew the reply into a fresh segment; we are
                    // its last reader and unlink it.
                    debug!(service = %self.service, segment = %reply_name, "reply in grown segment");
                    let reply_segment = match Segment::open(&reply_name) {
                        Ok(reply_segment) => reply_segment,
                        Err(err) => {
                            Segment::unlink(&reply_name);
                            return Err(err.into());
                        }
                    };
                    let reply = reply_segment.read_payload();
                    Segment::unlink(&reply_name);
                    Ok(reply?)
                }
            }
            ControlFrame::Error { message } => Err(RpcError::Remote(message)),
            other => Err(RpcError::Protocol(format!("expected DONE, got {}", other.tag_name()))),
        }
    }

    fn connect(&self) -> Result<UnixStream, RpcError> {
        let stream = UnixStream::connect(&self.path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => {
                RpcError::NotFound(self.service.clone())
            }
            _ => RpcError::Transport(err),
        })?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        Ok(stream)
    }
}
