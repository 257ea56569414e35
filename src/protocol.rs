//! Wire protocol shared by the `llx` client and the `llxd` daemon.
//!
//! Every request is one envelope on a fresh connection:
//! 1 byte message type + 4 bytes big-endian payload size + payload.
//! The response is an unframed byte stream terminated by the daemon
//! closing the connection.

use std::io::Read;
use thiserror::Error;

/// Size of the fixed envelope header in bytes.
pub const HEADER_LEN: usize = 5;

/// Largest payload the daemon will accept (1 MiB).
pub const MAX_PAYLOAD: usize = 1 << 20;

/// Confirmation line sent back on a shutdown request.
pub const SHUTDOWN_ACK: &str = "llxd shutting down\n";

/// Errors raised while decoding an envelope.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the stream before the header was complete.
    #[error("short read: expected {expected} header bytes, got {got}")]
    ShortHeader { expected: usize, got: usize },

    /// The peer closed the stream before the announced payload arrived.
    #[error("short read: expected {expected} payload bytes, got {got}")]
    ShortPayload { expected: usize, got: usize },

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("unknown control command {0}")]
    UnknownControl(u8),

    #[error("control message without a command byte")]
    EmptyControl,

    #[error("payload too large: {0} bytes")]
    TooLarge(usize),

    /// Any other transport failure, including read timeouts.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message type tag carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Prompt = 0,
    Control = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Prompt),
            1 => Ok(MessageType::Control),
            other => Err(ProtocolError::UnknownType(other)),
        }
    }
}

/// Command carried in the payload of a `Control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCommand {
    Shutdown = 0,
}

impl TryFrom<u8> for ControlCommand {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ControlCommand::Shutdown),
            other => Err(ProtocolError::UnknownControl(other)),
        }
    }
}

/// Decoded envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageType,
    pub payload_size: u32,
}

impl Header {
    /// Type byte followed by the big-endian payload size.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.kind as u8;
        buf[1..].copy_from_slice(&self.payload_size.to_be_bytes());
        buf
    }

    /// Parse a header, rejecting unknown type bytes.
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self, ProtocolError> {
        let kind = MessageType::try_from(buf[0])?;
        let payload_size = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        Ok(Self { kind, payload_size })
    }
}

/// One complete message: type tag plus raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// A prompt carrying raw UTF-8 text.
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Prompt,
            payload: text.into().into_bytes(),
        }
    }

    /// A control message carrying a single command byte.
    pub fn control(command: ControlCommand) -> Self {
        Self {
            kind: MessageType::Control,
            payload: vec![command as u8],
        }
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let header = Header {
            kind: self.kind,
            payload_size: self.payload.len() as u32,
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&header.encode());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Interpret the payload of a `Control` message.
    ///
    /// Returns `Ok(None)` for prompts.
    pub fn control_command(&self) -> Result<Option<ControlCommand>, ProtocolError> {
        match self.kind {
            MessageType::Prompt => Ok(None),
            MessageType::Control => {
                let byte = *self.payload.first().ok_or(ProtocolError::EmptyControl)?;
                ControlCommand::try_from(byte).map(Some)
            }
        }
    }

    /// Prompt text, with invalid UTF-8 replaced rather than rejected.
    pub fn prompt_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Whether this is a well-formed shutdown request.
    pub fn is_shutdown(&self) -> bool {
        matches!(self.control_command(), Ok(Some(ControlCommand::Shutdown)))
    }
}

/// Read one envelope from a blocking stream.
///
/// Reads exactly the header, then exactly `payload_size` bytes. Any early
/// end of stream is reported as a short read and nothing is returned.
pub fn read_envelope<R: Read>(reader: &mut R) -> Result<Envelope, ProtocolError> {
    let mut header_buf = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header_buf)?;
    if got < HEADER_LEN {
        return Err(ProtocolError::ShortHeader {
            expected: HEADER_LEN,
            got,
        });
    }
    let header = Header::decode(&header_buf)?;

    let len = header.payload_size as usize;
    if len > MAX_PAYLOAD {
        return Err(ProtocolError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    let got = read_full(reader, &mut payload)?;
    if got < len {
        return Err(ProtocolError::ShortPayload { expected: len, got });
    }

    let envelope = Envelope {
        kind: header.kind,
        payload,
    };
    // Reject unparsable control payloads here so they never reach the queue.
    envelope.control_command()?;
    Ok(envelope)
}

/// Like `read_exact`, but reports how many bytes arrived before EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize, ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::Io(e)),
        }
    }
    Ok(filled)
}
