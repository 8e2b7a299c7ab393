//! RIDE wire framing. Every frame is a 4-byte big-endian total length
//! (counting the length word and magic themselves), the ASCII magic `RIDE`,
//! then a UTF-8 payload: either a JSON 2-array `[name, body]`, a bare
//! handshake line (`UsingProtocol=2`), or a legacy `<...>` greeting from
//! interpreters too old to speak protocol 2.

use bytes::{Buf, BytesMut};
use serde_json::Value;
use std::borrow::Cow;

use super::error::Error;

/// Length word plus `RIDE` magic.
pub const FRAME_PREAMBLE: usize = 8;

const FRAME_MAGIC: &[u8; 4] = b"RIDE";
const INITIAL_BUF_CAPACITY: usize = 0x10_0000;

/// Longest payload echoed into the debug log before truncation.
const MAX_LOGGED: usize = 1000;

/// One decoded item from the inbound byte stream.
#[derive(Debug)]
pub enum Decoded {
    /// A `[name, body]` protocol message.
    Message { name: String, body: Value },
    /// `UsingProtocol=<version>` acknowledgment; accepted only for version 2.
    Handshake { accepted: bool, version: String },
    /// A pre-v15 interpreter announced itself; reported once per stream.
    LegacyGreeting,
}

/// Incremental decoder over an append-only byte stream. Tolerates frames
/// split across reads and several frames per read; the backing buffer grows
/// as needed without dropping unread bytes.
pub struct FrameCodec {
    buf: BytesMut,
    warned_legacy: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_BUF_CAPACITY),
            warned_legacy: false,
        }
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes to the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode the next complete item, if any. A protocol error poisons the
    /// stream: the caller must abandon it.
    pub fn next(&mut self) -> Result<Option<Decoded>, Error> {
        loop {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            let declared = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            let total = declared as usize;
            if total <= FRAME_PREAMBLE {
                return Err(Error::BadFrame(declared));
            }
            if self.buf.len() < total {
                return Ok(None);
            }

            let frame = self.buf.copy_to_bytes(total);
            let payload = String::from_utf8(frame[FRAME_PREAMBLE..].to_vec())?;
            log::debug!(target: "codec", "recv {}", trunc(&payload));

            match payload.as_bytes().first() {
                Some(b'[') => {
                    let (name, body): (String, Value) = serde_json::from_str(&payload)?;
                    return Ok(Some(Decoded::Message { name, body }));
                }
                Some(b'<') => {
                    if !self.warned_legacy {
                        self.warned_legacy = true;
                        return Ok(Some(Decoded::LegacyGreeting));
                    }
                }
                _ => {
                    if let Some(version) = payload.strip_prefix("UsingProtocol=") {
                        return Ok(Some(Decoded::Handshake {
                            accepted: version == "2",
                            version: version.to_string(),
                        }));
                    }
                    // other bare lines (e.g. the interpreter's own
                    // SupportedProtocols announcement) carry no state
                    log::debug!(target: "codec", "ignoring greeting line {}", trunc(&payload));
                }
            }
        }
    }
}

/// Wrap a payload in the length-prefixed RIDE frame.
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let total = FRAME_PREAMBLE + payload.len();
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u32).to_be_bytes());
    out.extend_from_slice(FRAME_MAGIC);
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Bound a payload for log output.
pub fn trunc(payload: &str) -> Cow<'_, str> {
    if payload.len() <= MAX_LOGGED {
        return Cow::Borrowed(payload);
    }
    let mut cut = MAX_LOGGED - 3;
    while !payload.is_char_boundary(cut) {
        cut -= 1;
    }
    Cow::Owned(format!("{}...", &payload[..cut]))
}
