//! Core types for the Sleipnir superframe engine.
//!
//! This module defines the frame taxonomy, wire-format constants, callsign
//! handling, receiver status events, and the crate-wide error type used
//! throughout the engine.

use serde::{Deserialize, Serialize};

/// Frames per superframe (one second of air time).
pub const FRAMES_PER_SUPERFRAME: usize = 25;

/// Frame duration in milliseconds.
pub const FRAME_DURATION_MS: u64 = 40;

/// Fixed size of an Opus voice frame as produced by the external codec.
pub const OPUS_FRAME_BYTES: usize = 40;

/// Data field size inside a 48-byte user payload (one byte is the tag,
/// eight bytes are the truncated MAC).
pub const FRAME_DATA_BYTES: usize = 39;

/// Size of voice/text/APRS/sync payloads before LDPC encoding.
pub const USER_PAYLOAD_BYTES: usize = 48;

/// Size of the authentication payload before LDPC encoding.
pub const AUTH_PAYLOAD_BYTES: usize = 32;

/// On-wire truncated Poly1305 tag size.
///
/// Truncating the 16-byte Poly1305 tag to 8 bytes trades integrity strength
/// for air time: the forgery budget becomes 2^-64 per frame, which is the
/// accepted design point for this waveform. No other truncation is permitted.
pub const WIRE_MAC_BYTES: usize = 8;

/// Codeword length for the rate-1/3 authentication matrix.
pub const AUTH_CODEWORD_BITS: usize = 768;

/// Codeword length for the rate-2/3 voice matrix.
pub const VOICE_CODEWORD_BITS: usize = 576;

/// Fragment body size for text/APRS messages (39 data bytes minus the
/// 3-byte fragment header).
pub const FRAGMENT_BODY_BYTES: usize = 36;

/// Sync frame magic, big-endian on the wire.
pub const SYNC_MAGIC: [u8; 8] = [0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE];

/// Default sync-frame insertion interval in superframes.
pub const DEFAULT_SYNC_INTERVAL: u8 = 5;

/// Default reassembly window for fragmented messages, in superframes.
pub const DEFAULT_REASSEMBLY_WINDOW: u32 = 8;

// ---------------------------------------------------------------------------
// Frame taxonomy
// ---------------------------------------------------------------------------

/// Logical frame type.
///
/// Voice, text and APRS frames carry their tag in the first payload byte.
/// Sync frames are recognized by the 8-byte magic instead (there is no room
/// for a tag byte next to it); `0xFF` is the value a parsed sync frame
/// reports. The auth frame has no tag at all: its position and LDPC rate
/// identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameTag {
    /// Opus voice data.
    Voice,
    /// APRS packet (possibly fragmented).
    Aprs,
    /// Text message (possibly fragmented).
    Text,
    /// Receiver acquisition sync frame.
    Sync,
}

impl FrameTag {
    /// Wire value of the tag byte.
    pub fn to_byte(self) -> u8 {
        match self {
            FrameTag::Voice => 0x00,
            FrameTag::Aprs => 0x01,
            FrameTag::Text => 0x02,
            FrameTag::Sync => 0xFF,
        }
    }

    /// Parse a wire tag byte. Returns `None` for illegal values.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x00 => Some(FrameTag::Voice),
            0x01 => Some(FrameTag::Aprs),
            0x02 => Some(FrameTag::Text),
            0xFF => Some(FrameTag::Sync),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Callsigns
// ---------------------------------------------------------------------------

/// A station callsign: 5 ASCII bytes, upper-cased, space-padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callsign([u8; 5]);

impl Callsign {
    /// Build from a string, upper-casing and space-padding to 5 bytes.
    /// Characters beyond the fifth are dropped; non-ASCII is rejected.
    pub fn new(s: &str) -> Result<Self> {
        if !s.is_ascii() {
            return Err(SleipnirError::InvalidCallsign(s.to_string()));
        }
        let mut bytes = [b' '; 5];
        for (dst, ch) in bytes.iter_mut().zip(s.trim().chars().take(5)) {
            *dst = ch.to_ascii_uppercase() as u8;
        }
        Ok(Callsign(bytes))
    }

    /// The raw 5 wire bytes.
    pub fn as_bytes(&self) -> &[u8; 5] {
        &self.0
    }

    /// Build from 5 wire bytes.
    pub fn from_bytes(bytes: [u8; 5]) -> Self {
        Callsign(bytes)
    }
}

impl std::fmt::Display for Callsign {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0).trim_end())
    }
}

// ---------------------------------------------------------------------------
// Receiver state and status events
// ---------------------------------------------------------------------------

/// Receiver synchronization state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// Scanning for a superframe boundary.
    Searching,
    /// Locked to the 25-frame boundary, counter tracked.
    Synced,
    /// Lock lost; about to re-enter `Searching`.
    Lost,
}

/// Decoder variant that produced a frame, reported in status events so a
/// future soft-decision path is observable without wire changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoderType {
    /// Iterative hard-decision bit flipping.
    HardBitFlip,
}

/// What a status event is reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    /// A user frame was decoded and delivered.
    FrameOk,
    /// A sync frame was validated at position 0.
    SyncFrame,
    /// The superframe's auth frame was processed.
    AuthFrame,
    /// Truncated MAC verification failed; payload dropped.
    MacInvalid,
    /// Payload failed to parse after decoding; frame dropped.
    FrameCorrupt,
    /// Tag byte was not a legal value; frame dropped.
    UnknownTag,
    /// Counter went backwards inside the replay window; superframe dropped.
    CounterReplay,
    /// Receiver transitioned `searching -> synced`.
    SyncAcquired,
    /// Receiver lost lock and is searching again.
    SyncLost,
    /// Superframe user payloads dropped by the `require_signatures` policy.
    PolicyReject,
    /// A fragmented message did not complete within the reassembly window.
    ReassemblyTimeout,
    /// A session-fatal condition; the session is closing.
    SessionFatal,
}

/// Per-frame (and per-transition) receiver status event.
///
/// The status queue is the single user-visible source of truth for link
/// quality and failure reporting; frame-level errors never propagate as
/// panics or `Err` beyond the parser.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    /// Superframe counter the event belongs to.
    pub superframe_counter: u32,
    /// Position in the superframe (0-24).
    pub position: u8,
    /// Event discriminant.
    pub kind: StatusKind,
    /// Signature verdict for the superframe's auth frame, when one exists.
    pub signature_valid: Option<bool>,
    /// MAC verdict for this frame, when a symmetric key is configured.
    pub mac_valid: Option<bool>,
    /// Whether the LDPC decoder converged to a zero syndrome.
    pub decoder_converged: bool,
    /// Unsatisfied parity checks remaining after decoding.
    pub syndrome_residual: usize,
    /// Which decoder produced the frame.
    pub decoder_type: DecoderType,
    /// Sender callsign, when known.
    pub sender_callsign: Option<Callsign>,
    /// Receiver sync state after processing the frame.
    pub sync_state: SyncState,
    /// Cumulative frames seen by this parser.
    pub frames_received: u64,
    /// Cumulative frames dropped or annotated as errored.
    pub frame_errors: u64,
}

// ---------------------------------------------------------------------------
// Bit/byte packing helpers
// ---------------------------------------------------------------------------

/// Unpack bytes to individual bits, MSB first within each byte.
pub fn bytes_to_bits(data: &[u8]) -> Vec<u8> {
    let mut bits = Vec::with_capacity(data.len() * 8);
    for byte in data {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1);
        }
    }
    bits
}

/// Pack individual bits to bytes, MSB first within each byte.
pub fn bits_to_bytes(bits: &[u8]) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &bit)| acc | ((bit & 1) << (7 - i)))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, SleipnirError>;

/// Errors that can occur in the Sleipnir core.
///
/// Only session-fatal and construction-time conditions surface as `Err`;
/// recoverable frame problems are reported through parse results and the
/// status queue instead.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SleipnirError {
    #[error("AList matrix malformed: {0}")]
    AListMalformed(String),

    #[error("failed to read matrix file {path}: {source_msg}")]
    MatrixIo { path: String, source_msg: String },

    #[error("key material rejected: {0}")]
    KeyFormatInvalid(String),

    #[error("nonce reuse detected for the session key; aborting session")]
    NonceReuse,

    #[error("signature operation failed: {0}")]
    SignatureMalformed(String),

    #[error("callsign is not 5 printable ASCII characters: {0:?}")]
    InvalidCallsign(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("info bit length {got} does not match matrix ({expected})")]
    InfoLengthMismatch { got: usize, expected: usize },

    #[error("codeword length {0} matches no known LDPC rate")]
    UnknownCodewordLength(usize),

    #[error("session is not in the required lifecycle state: {0}")]
    SessionLifecycle(&'static str),

    #[error("queue {0} is closed")]
    QueueClosed(&'static str),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
