//! Length-prefixed framing for notifications on a TCP stream.
//!
//! Wire format, repeated for every message:
//! ```text
//! [payload_len:4 little-endian][payload:N]
//! ```
//! There is no magic number and no version byte; both ends agree on the
//! payload schema out of band (bincode-encoded [`Notification`]s).
//!
//! # Reassembly (for beginners)
//!
//! TCP is a byte stream, not a message stream.  One `read()` may return half
//! a frame, exactly one frame, or the tail of one frame followed by three
//! more.  [`FrameDecoder`] hides this: feed it whatever bytes arrived and it
//! hands back every payload that is now complete, keeping the leftovers for
//! the next call.
//!
//! The decoder is an explicit two-state machine:
//!
//! ```text
//!              4 header bytes collected
//! AwaitingLength ─────────────────────────▶ AwaitingPayload { needed }
//!       ▲                                          │
//!       └──────────── payload complete ────────────┘
//! ```
//!
//! A zero-length frame goes straight back to `AwaitingLength` and yields an
//! empty payload.

use thiserror::Error;
use tracing::warn;

use crate::notification::Notification;

/// Size of the length header in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Declared payload length above which a warning is logged (50 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 50 * 1024 * 1024;

/// Errors produced while framing or parsing notifications.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it announces.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// A peer declared a frame above the configured limit and the decoder
    /// is set to reject such frames.
    #[error("frame of {declared} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { declared: usize, limit: usize },

    /// The payload does not hold a valid notification.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The notification could not be serialized.
    #[error("failed to serialize notification: {0}")]
    Serialize(String),

    /// The payload does not fit the 32-bit length header.
    #[error("payload of {len} bytes does not fit a frame")]
    PayloadTooLarge { len: usize },
}

// ── Frame encoding ────────────────────────────────────────────────────────────

/// Prefixes `payload` with its 4-byte little-endian length.
///
/// # Errors
///
/// Returns [`ProtocolError::PayloadTooLarge`] if the length does not fit in
/// a `u32`.
///
/// # Examples
///
/// ```rust
/// use mesa_core::protocol::codec::{decode_frame, encode_frame};
///
/// let frame = encode_frame(b"hello").unwrap();
/// assert_eq!(frame.len(), 4 + 5);
/// let (payload, consumed) = decode_frame(&frame).unwrap();
/// assert_eq!(payload, b"hello");
/// assert_eq!(consumed, frame.len());
/// ```
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = encode_length(payload.len())?;
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&len);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Encodes a payload length as a frame header.
pub fn encode_length(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE], ProtocolError> {
    u32::try_from(len)
        .map(u32::to_le_bytes)
        .map_err(|_| ProtocolError::PayloadTooLarge { len })
}

/// Decodes a length header.
pub fn decode_length(header: [u8; LENGTH_PREFIX_SIZE]) -> u32 {
    u32::from_le_bytes(header)
}

/// Decodes one whole frame from the start of `bytes`.
///
/// Returns the payload and the total number of bytes consumed (header +
/// payload).
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `bytes` does not hold the
/// complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<(&[u8], usize), ProtocolError> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: LENGTH_PREFIX_SIZE,
            available: bytes.len(),
        });
    }
    let len = decode_length([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let total = LENGTH_PREFIX_SIZE + len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    Ok((&bytes[LENGTH_PREFIX_SIZE..total], total))
}

// ── Notification payloads ─────────────────────────────────────────────────────

/// Serializes `notification` into a payload (no length prefix).
///
/// # Errors
///
/// Returns [`ProtocolError::Serialize`] if bincode fails.
pub fn encode_notification(notification: &Notification) -> Result<Vec<u8>, ProtocolError> {
    bincode::serialize(notification).map_err(|e| ProtocolError::Serialize(e.to_string()))
}

/// Parses a payload produced by [`encode_notification`].
///
/// # Errors
///
/// Returns [`ProtocolError::MalformedPayload`] if the bytes are not a valid
/// notification.
pub fn decode_notification(payload: &[u8]) -> Result<Notification, ProtocolError> {
    bincode::deserialize(payload).map_err(|e| ProtocolError::MalformedPayload(e.to_string()))
}

/// Serializes and frames `notification` in one step.
///
/// # Errors
///
/// See [`encode_notification`] and [`encode_frame`].
pub fn frame_notification(notification: &Notification) -> Result<Vec<u8>, ProtocolError> {
    encode_frame(&encode_notification(notification)?)
}

// ── Incremental decoder ───────────────────────────────────────────────────────

/// Receive state of a [`FrameDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    /// Collecting the 4-byte header; `filled` bytes of it are buffered.
    AwaitingLength { filled: usize },
    /// Header decoded; `needed` more payload bytes are outstanding.
    AwaitingPayload { needed: usize },
}

/// What to do with frames whose declared length exceeds the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OversizePolicy {
    /// Log a warning and keep reading.
    Warn,
    /// Fail with [`ProtocolError::FrameTooLarge`].
    Reject,
}

/// Reassembles length-prefixed frames from arbitrarily split reads.
#[derive(Debug)]
pub struct FrameDecoder {
    state: RecvState,
    header: [u8; LENGTH_PREFIX_SIZE],
    payload: Vec<u8>,
    max_frame_len: usize,
    policy: OversizePolicy,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN, OversizePolicy::Warn)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize, policy: OversizePolicy) -> Self {
        Self {
            state: RecvState::AwaitingLength { filled: 0 },
            header: [0; LENGTH_PREFIX_SIZE],
            payload: Vec::new(),
            max_frame_len,
            policy,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    /// `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == RecvState::AwaitingLength { filled: 0 }
    }

    /// Feeds `chunk` and returns every payload it completes, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::FrameTooLarge`] under
    /// [`OversizePolicy::Reject`].  The decoder must be discarded afterwards.
    pub fn push(&mut self, mut chunk: &[u8]) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut complete = Vec::new();
        while !chunk.is_empty() {
            match self.state {
                RecvState::AwaitingLength { filled } => {
                    let take = (LENGTH_PREFIX_SIZE - filled).min(chunk.len());
                    self.header[filled..filled + take].copy_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    let filled = filled + take;
                    if filled < LENGTH_PREFIX_SIZE {
                        self.state = RecvState::AwaitingLength { filled };
                        continue;
                    }
                    let needed = decode_length(self.header) as usize;
                    self.check_size(needed)?;
                    if needed == 0 {
                        complete.push(Vec::new());
                        self.state = RecvState::AwaitingLength { filled: 0 };
                    } else {
                        self.payload = Vec::with_capacity(needed.min(self.max_frame_len));
                        self.state = RecvState::AwaitingPayload { needed };
                    }
                }
                RecvState::AwaitingPayload { needed } => {
                    let take = needed.min(chunk.len());
                    self.payload.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];
                    if take == needed {
                        complete.push(std::mem::take(&mut self.payload));
                        self.state = RecvState::AwaitingLength { filled: 0 };
                    } else {
                        self.state = RecvState::AwaitingPayload {
                            needed: needed - take,
                        };
                    }
                }
            }
        }
        Ok(complete)
    }

    fn check_size(&self, declared: usize) -> Result<(), ProtocolError> {
        if declared <= self.max_frame_len {
            return Ok(());
        }
        match self.policy {
            OversizePolicy::Warn => {
                warn!(
                    "peer declared a {declared} byte frame, above the {} byte limit",
                    self.max_frame_len
                );
                Ok(())
            }
            OversizePolicy::Reject => Err(ProtocolError::FrameTooLarge {
                declared,
                limit: self.max_frame_len,
            }),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
