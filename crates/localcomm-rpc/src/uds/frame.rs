use std::io::{self, Read, Write};

use thiserror::Error;

/// Largest accepted control-frame body. Control frames carry names, sizes
/// and short error strings; anything bigger is a protocol violation.
pub const MAX_FRAME_BODY: usize = 64 * 1024;

/// Error messages are clipped to this many bytes before framing.
const MAX_ERROR_MESSAGE: usize = 512;

const TAG_REQUEST: u8 = 0x01;
const TAG_READY: u8 = 0x02;
const TAG_DONE: u8 = 0x03;
const TAG_ERROR: u8 = 0x7F;

/// Frame layer failures. `PeerClosed` covers every EOF, including one on a
/// frame boundary: each state of the exchange expects exactly one more frame,
/// so a clean close is still the peer walking away early.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("peer closed the connection mid-frame")]
    PeerClosed,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Control messages exchanged over the per-call socket.
///
/// On the wire each frame is a 4-byte big-endian body length followed by the
/// body: a tag byte, then for `Request`/`Done` a little-endian u16 name
/// length, the segment name and a little-endian u64 capacity, and for
/// `Error` a little-endian u16 length plus a UTF-8 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    Request { segment: String, capacity: u64 },
    Ready,
    Done { segment: String, capacity: u64 },
    Error { message: String },
}

impl ControlFrame {
    pub fn tag_name(&self) -> &'static str {
        match self {
            Self::Request { .. } => "REQUEST",
            Self::Ready => "READY",
            Self::Done { .. } => "DONE",
            Self::Error { .. } => "ERROR",
        }
    }

    /// Appends the frame body, tag included, length prefix excluded.
    fn encode(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Request { segment, capacity } => {
                buf.push(TAG_REQUEST);
                encode_named(buf, segment, *capacity);
            }
            Self::Ready => buf.push(TAG_READY),
            Self::Done { segment, capacity } => {
                buf.push(TAG_DONE);
                encode_named(buf, segment, *capacity);
            }
            Self::Error { message } => {
                buf.push(TAG_ERROR);
                let clipped = clip_message(message);
                buf.extend_from_slice(&(clipped.len() as u16).to_le_bytes());
                buf.extend_from_slice(clipped.as_bytes());
            }
        }
    }

    fn decode(body: &[u8]) -> Result<Self, WireError> {
        let (&tag, rest) =
            body.split_first().ok_or_else(|| WireError::Protocol("empty frame body".to_string()))?;
        match tag {
            TAG_REQUEST => {
                let (segment, capacity) = decode_named(rest)?;
                Ok(Self::Request { segment, capacity })
            }
            TAG_READY => {
                if !rest.is_empty() {
                    return Err(WireError::Protocol("READY frame with a body".to_string()));
                }
                Ok(Self::Ready)
            }
            TAG_DONE => {
                let (segment, capacity) = decode_named(rest)?;
                Ok(Self::Done { segment, capacity })
            }
            TAG_ERROR => {
                if rest.len() < 2 {
                    return Err(WireError::Protocol("truncated ERROR frame".to_string()));
                }
                let msg_len = u16::from_le_bytes([rest[0], rest[1]]) as usize;
                if rest.len() != 2 + msg_len {
                    return Err(WireError::Protocol("bad ERROR frame length".to_string()));
                }
                let message = std::str::from_utf8(&rest[2..])
                    .map_err(|_| WireError::Protocol("ERROR message is not UTF-8".to_string()))?
                    .to_string();
                Ok(Self::Error { message })
            }
            other => Err(WireError::Protocol(format!("unknown frame tag {other:#04x}"))),
        }
    }
}

fn encode_named(buf: &mut Vec<u8>, name: &str, capacity: u64) {
    buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&capacity.to_le_bytes());
}

fn decode_named(body: &[u8]) -> Result<(String, u64), WireError> {
    if body.len() < 2 {
        return Err(WireError::Protocol("truncated frame body".to_string()));
    }
    let name_len = u16::from_le_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if rest.len() != name_len + 8 {
        return Err(WireError::Protocol("bad frame body length".to_string()));
    }
    let name = std::str::from_utf8(&rest[..name_len])
        .map_err(|_| WireError::Protocol("segment name is not UTF-8".to_string()))?
        .to_string();
    let capacity = u64::from_le_bytes(rest[name_len..].try_into().unwrap());
    Ok((name, capacity))
}

fn clip_message(message: &str) -> &str {
    if message.len() <= MAX_ERROR_MESSAGE {
        return message;
    }
    let mut end = MAX_ERROR_MESSAGE;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    &message[..end]
}

/// Writes one frame and flushes it completely before returning.
pub fn write_frame(writer: &mut impl Write, frame: &ControlFrame) -> Result<(), WireError> {
    let mut buf = Vec::with_capacity(64);
    buf.extend_from_slice(&[0; 4]);
    frame.encode(&mut buf);
    let body_len = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&body_len.to_be_bytes());
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Reads exactly one frame: 4 length bytes, then the body.
pub fn read_frame(reader: &mut impl Read) -> Result<ControlFrame, WireError> {
    let mut prefix = [0u8; 4];
    read_full(reader, &mut prefix)?;
    let body_len = u32::from_be_bytes(prefix) as usize;
    if body_len > MAX_FRAME_BODY {
        return Err(WireError::Protocol(format!(
            "frame body of {body_len} bytes exceeds the {MAX_FRAME_BODY} byte cap"
        )));
    }
    let mut body = vec![0u8; body_len];
    read_full(reader, &mut body)?;
    ControlFrame::decode(&body)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<(), WireError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(WireError::PeerClosed),
        Err(err) => Err(err.into()),
    }
}
