use std::{
    collections::VecDeque,
    fs,
    io::{self, Read},
    os::{
        fd::{FromRawFd, IntoRawFd},
        unix::{fs::PermissionsExt, net::UnixStream as StdUnixStream},
    },
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    time::Duration,
};

use localcomm_shm::{HEADER_SIZE, Segment, SegmentError};
use localcomm_utils::{
    directories::ensure_runtime_dir, safe_panic, socket_path, validate_service_name,
};
use mio::{Events, Interest, Poll, Token, net::UnixListener};
use tracing::{debug, info, warn};

use crate::{
    error::RpcError,
    uds::frame::{ControlFrame, WireError, read_frame, write_frame},
};

/// Grown reply segments are provisioned in page multiples.
const PAGE_SIZE: usize = 4096;

/// How long an accepted connection gets to produce its REQUEST frame before
/// the host gives up on the peer and serves the next one.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the caller to hang up after DONE before the grown
/// reply segment is unlinked anyway.
const REPLY_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// A service implementation: consumes request bytes, produces reply bytes or
/// a user-facing error message.
///
/// Implemented by any `FnMut(&[u8]) -> Result<Vec<u8>, String>` closure, so
/// plain functions register directly.
pub trait Handler: Send {
    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>, String>;
}

impl<F> Handler for F
where
    F: FnMut(&[u8]) -> Result<Vec<u8>, String> + Send,
{
    fn handle(&mut self, request: &[u8]) -> Result<Vec<u8>, String> {
        self(request)
    }
}

struct RegisteredService {
    token: Token,
    name: String,
    path: PathBuf,
    listener: UnixListener,
    handler: Box<dyn Handler>,
}

struct PendingCall {
    token: Token,
    stream: StdUnixStream,
}

/// Server side of the transport.
///
/// One host owns the listener of every service it registered and multiplexes
/// them over a single `mio::Poll`. Dispatch is single-threaded cooperative:
/// at most one handler runs at a time, connections are served whole, in
/// accept order. Handlers are expected to be CPU-bound over large payloads;
/// the transport's job is moving their bytes cheaply, not overlapping work.
///
/// Per connection the host walks
/// `AWAIT_REQUEST -> AWAIT_USER_HANDOFF -> EXECUTING -> DONE_SENT -> CLOSED`,
/// bailing out to an ERROR frame at the first misstep. Transport errors are
/// logged and the host keeps serving; only registration problems are
/// returned to the embedding program.
pub struct ServiceHost {
    poll: Poll,
    events: Events,
    services: Vec<RegisteredService>,
    pending: VecDeque<PendingCall>,
    next_token: usize,
}

impl ServiceHost {
    pub fn new() -> Result<Self, RpcError> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            services: Vec::new(),
            pending: VecDeque::new(),
            next_token: 0,
        })
    }

    /// Binds `name`'s socket and installs `handler` for it.
    ///
    /// A pre-existing socket file is probed with a connect first: a live
    /// owner means [`RpcError::AddressInUse`], a refused connect means a
    /// stale file from an unclean shutdown, which is removed before binding.
    pub fn register<H: Handler + 'static>(
        &mut self,
        name: &str,
        handler: H,
    ) -> Result<(), RpcError> {
        validate_service_name(name)?;
        if self.services.iter().any(|s| s.name == name) {
            return Err(RpcError::AddressInUse(name.to_string()));
        }
        ensure_runtime_dir()?;
        let path = socket_path(name);

        let mut listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
                if StdUnixStream::connect(&path).is_ok() {
                    return Err(RpcError::AddressInUse(name.to_string()));
                }
                debug!(service = %name, "removing stale socket");
                fs::remove_file(&path)?;
                UnixListener::bind(&path)?
            }
            Err(err) => return Err(err.into()),
        };
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        info!(service = %name, path = %path.display(), "service registered");
        self.services.push(RegisteredService {
            token,
            name: name.to_string(),
            path,
            listener,
            handler: Box::new(handler),
        });
        Ok(())
    }

    /// Closes `name`'s listener and removes its socket file. Connections
    /// already accepted but not yet served are refused.
    pub fn unregister(&mut self, name: &str) -> Result<(), RpcError> {
        let Some(idx) = self.services.iter().position(|s| s.name == name) else {
            return Err(RpcError::NotFound(name.to_string()));
        };
        let mut service = self.services.remove(idx);
        let _ = self.poll.registry().deregister(&mut service.listener);
        if let Err(err) = fs::remove_file(&service.path)
            && err.kind() != io::ErrorKind::NotFound
        {
            warn!(service = %name, ?err, "couldn't remove socket file");
        }
        info!(service = %name, "service unregistered");
        Ok(())
    }

    /// Waits up to `timeout` (`None` waits forever) for a connection on any
    /// registered service, serves at most one call, and returns whether one
    /// was served.
    pub fn run_one(&mut self, timeout: Option<Duration>) -> Result<bool, RpcError> {
        if let Some(call) = self.pending.pop_front() {
            self.serve(call);
            return Ok(true);
        }

        self.poll.poll(&mut self.events, timeout)?;
        let ready: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
        for token in ready {
            self.accept_ready(token);
        }

        match self.pending.pop_front() {
            Some(call) => {
                self.serve(call);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Serves calls until the poll is interrupted by a signal.
    pub fn run_forever(&mut self) -> Result<(), RpcError> {
        loop {
            match self.run_one(None) {
                Ok(_) => {}
                Err(RpcError::Transport(err)) if err.kind() == io::ErrorKind::Interrupted => {
                    info!("interrupted, shutting down");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drains the accept queue behind `token`. mio wakeups are edge-like, so
    /// every pending connection is accepted now; they are still served one
    /// per [`run_one`](Self::run_one).
    fn accept_ready(&mut self, token: Token) {
        let Some(idx) = self.services.iter().position(|s| s.token == token) else {
            safe_panic!("poll event for unknown token {token:?}");
            return;
        };
        loop {
            match self.services[idx].listener.accept() {
                Ok((stream, _addr)) => match into_blocking(stream) {
                    Ok(stream) => self.pending.push_back(PendingCall { token, stream }),
                    Err(err) => warn!(?err, "couldn't configure accepted connection"),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    warn!(service = %self.services[idx].name, ?err, "accept failed");
                    break;
                }
            }
        }
    }

    fn serve(&mut self, call: PendingCall) {
        let PendingCall { token, mut stream } = call;
        let Some(idx) = self.services.iter().position(|s| s.token == token) else {
            send_error(&mut stream, "service is gone");
            return;
        };

        let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));

        let (request_name, advertised) = match read_frame(&mut stream) {
            Ok(ControlFrame::Request { segment, capacity }) => (segment, capacity),
            Ok(frame) => {
                send_error(&mut stream, &format!("expected REQUEST, got {}", frame.tag_name()));
                return;
            }
            Err(err) => {
                reject_malformed(&mut stream, &err);
                return;
            }
        };

        let service = &mut self.services[idx];
        debug!(service = %service.name, segment = %request_name, capacity = advertised, "request");

        let mut segment = match Segment::open(&request_name) {
            Ok(segment) => segment,
            Err(err) => {
                send_error(&mut stream, &format!("couldn't map request segment: {err}"));
                return;
            }
        };
        let request = match segment.read_payload() {
            Ok(request) => request,
            Err(err @ SegmentError::Corrupt { .. }) => {
                send_error(&mut stream, &format!("corrupt request segment: {err}"));
                return;
            }
            Err(err) => {
                send_error(&mut stream, &format!("couldn't read request: {err}"));
                return;
            }
        };

        if let Err(err) = write_frame(&mut stream, &ControlFrame::Ready) {
            debug!(service = %service.name, %err, "peer went away before READY");
            return;
        }

        let reply = match run_handler(service.handler.as_mut(), &request) {
            Ok(reply) => reply,
            Err(message) => {
                debug!(service = %service.name, %message, "handler failed");
                send_error(&mut stream, &message);
                // The caller unlinks its request segment too; doubling up
                // here keeps a crashed caller from leaking it.
                Segment::unlink(&request_name);
                return;
            }
        };

        // Reuse the request segment whenever the reply fits, grow a fresh one
        // otherwise. The caller unlinks whatever DONE names; for a grown
        // segment the host unlinks once more after hangup, covering a caller
        // that crashed between DONE and its own unlink.
        if HEADER_SIZE + reply.len() <= segment.capacity() {
            if let Err(err) = segment.write_payload(&reply) {
                send_error(&mut stream, &format!("couldn't write reply: {err}"));
                return;
            }
            let done =
                ControlFrame::Done { segment: request_name, capacity: segment.capacity() as u64 };
            if let Err(err) = write_frame(&mut stream, &done) {
                debug!(service = %service.name, %err, "peer went away before DONE");
            }
        } else {
            let capacity = (HEADER_SIZE + reply.len()).next_multiple_of(PAGE_SIZE);
            let mut reply_segment = match Segment::allocate(&service.name, capacity) {
                Ok(reply_segment) => reply_segment,
                Err(err) => {
                    warn!(service = %service.name, %err, "couldn't grow reply segment");
                    send_error(&mut stream, &format!("couldn't allocate reply segment: {err}"));
                    return;
                }
            };
            if let Err(err) = reply_segment.write_payload(&reply) {
                send_error(&mut stream, &format!("couldn't write reply: {err}"));
                Segment::unlink(reply_segment.name());
                return;
            }
            let done = ControlFrame::Done {
                segment: reply_segment.name().to_string(),
                capacity: capacity as u64,
            };
            if let Err(err) = write_frame(&mut stream, &done) {
                debug!(service = %service.name, %err, "peer went away before DONE, dropping reply");
                Segment::unlink(reply_segment.name());
                return;
            }
            wait_for_hangup(&mut stream);
            Segment::unlink(reply_segment.name());
        }
    }
}

impl Drop for ServiceHost {
    fn drop(&mut self) {
        let names: Vec<String> = self.services.iter().map(|s| s.name.clone()).collect();
        for name in names {
            let _ = self.unregister(&name);
        }
    }
}

/// mio hands out non-blocking streams; the per-call exchange is strictly
/// sequential, so the connection is switched to blocking for its lifetime.
fn into_blocking(stream: mio::net::UnixStream) -> io::Result<StdUnixStream> {
    let stream = unsafe { StdUnixStream::from_raw_fd(stream.into_raw_fd()) };
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Handler panics are contained at the dispatch boundary and surfaced to the
/// caller like any other handler failure.
fn run_handler(handler: &mut dyn Handler, request: &[u8]) -> Result<Vec<u8>, String> {
    match catch_unwind(AssertUnwindSafe(|| handler.handle(request))) {
        Ok(result) => result,
        Err(panic) => Err(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Best effort: the peer may already be gone.
fn send_error(stream: &mut StdUnixStream, message: &str) {
    let frame = ControlFrame::Error { message: message.to_string() };
    if let Err(err) = write_frame(stream, &frame) {
        debug!(%err, "couldn't deliver error frame");
    }
}

fn reject_malformed(stream: &mut StdUnixStream, err: &WireError) {
    match err {
        WireError::Protocol(_) => send_error(stream, &err.to_string()),
        WireError::PeerClosed | WireError::Io(_) => {
            debug!(%err, "connection dropped before REQUEST");
        }
    }
}

/// After DONE the caller maps the grown segment, reads it, unlinks it and
/// closes. Waiting for that close keeps the host's backstop unlink from
/// racing the caller's open.
fn wait_for_hangup(stream: &mut StdUnixStream) {
    if stream.set_read_timeout(Some(REPLY_HANDOFF_TIMEOUT)).is_err() {
        return;
    }
    let mut byte = [0u8; 1];
    match stream.read(&mut byte) {
        Ok(0) | Err(_) => {}
        Ok(_) => debug!("unexpected trailing bytes from caller"),
    }
}
