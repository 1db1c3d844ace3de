//! Frame payload construction and parsing.
//!
//! Wire layouts (big-endian, MSB first within bytes):
//!
//! ```text
//! voice/text/APRS (48 B): tag(1) || data(39) || mac8(8)
//! text/APRS data:         seq_id(1) || frag_index(1) || frag_count(1) || body(36)
//! sync (48 B):            magic(8) || counter_be32 || position_be32(=0) || zeros(32)
//! auth (32 B):            signature(32)
//! ```
//!
//! Voice data is the leading 39 bytes of the 40-byte Opus frame; the layout
//! has no room for the final byte next to the tag and truncated MAC, so the
//! receive side re-pads it with zero (inherited from the reference modem).
//!
//! The 8-byte `mac8` field is the truncated Poly1305 tag. Its coverage
//! depends on the security mode: MAC-only frames authenticate
//! `tag || data || AAD` with the data in clear, encrypted frames carry the
//! AEAD tag over the ciphertext with `AAD = counter || position || callsign`.

use crate::crypto::{derive_nonce, CryptoProvider, MAC_KEY_BYTES, NONCE_BYTES};
use crate::types::{
    Callsign, FrameTag, Result, AUTH_PAYLOAD_BYTES, FRAGMENT_BODY_BYTES, FRAME_DATA_BYTES,
    OPUS_FRAME_BYTES, SYNC_MAGIC, USER_PAYLOAD_BYTES, WIRE_MAC_BYTES,
};

/// AAD bound into every frame MAC: `counter_be32 || position || callsign`.
pub fn frame_aad(counter: u32, position: u8, callsign: Callsign) -> [u8; 10] {
    let mut aad = [0u8; 10];
    aad[..4].copy_from_slice(&counter.to_be_bytes());
    aad[4] = position;
    aad[5..].copy_from_slice(callsign.as_bytes());
    aad
}

// ---------------------------------------------------------------------------
// Security modes
// ---------------------------------------------------------------------------

/// Symmetric session material borrowed for one frame operation.
#[derive(Clone, Copy)]
pub struct SymmetricKeys<'a> {
    pub provider: &'a CryptoProvider,
    pub key: &'a [u8; MAC_KEY_BYTES],
    pub nonce_base: &'a [u8; NONCE_BYTES],
}

/// Per-frame security mode.
#[derive(Clone, Copy, Default)]
pub enum Security<'a> {
    /// No symmetric key: the mac8 field is zero and frames are marked
    /// plaintext.
    #[default]
    Plaintext,
    /// Authentication only: data rides in clear, mac8 covers
    /// `tag || data || AAD`.
    Mac(SymmetricKeys<'a>),
    /// Full AEAD: data is ChaCha20-Poly1305 ciphertext, mac8 is the
    /// truncated tag over it.
    Encrypted(SymmetricKeys<'a>),
}

/// Everything the codec needs to know about a frame's place in the stream.
#[derive(Clone, Copy)]
pub struct FrameContext<'a> {
    pub counter: u32,
    pub position: u8,
    pub security: Security<'a>,
}

// ---------------------------------------------------------------------------
// Fragments
// ---------------------------------------------------------------------------

/// One text/APRS fragment: a 3-byte header plus a 36-byte body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    /// Message sequence id, shared by all fragments of one message.
    pub seq_id: u8,
    /// Zero-based fragment index.
    pub index: u8,
    /// Total fragments in the message (>= 1).
    pub count: u8,
    /// Body bytes; the final fragment is zero-padded.
    pub body: [u8; FRAGMENT_BODY_BYTES],
}

impl Fragment {
    /// Pack into the 39-byte frame data field.
    pub fn to_data(&self) -> [u8; FRAME_DATA_BYTES] {
        let mut data = [0u8; FRAME_DATA_BYTES];
        data[0] = self.seq_id;
        data[1] = self.index;
        data[2] = self.count;
        data[3..].copy_from_slice(&self.body);
        data
    }

    /// Unpack from a 39-byte frame data field.
    pub fn from_data(data: &[u8; FRAME_DATA_BYTES]) -> std::result::Result<Self, FrameParseError> {
        let (seq_id, index, count) = (data[0], data[1], data[2]);
        if count == 0 || index >= count {
            return Err(FrameParseError::FragmentHeader { index, count });
        }
        let mut body = [0u8; FRAGMENT_BODY_BYTES];
        body.copy_from_slice(&data[3..]);
        Ok(Fragment {
            seq_id,
            index,
            count,
            body,
        })
    }
}

/// Split a message into consecutive fragments; the last body is
/// zero-padded. Messages longer than 255 fragments do not fit the header.
pub fn split_message(seq_id: u8, message: &[u8]) -> Result<Vec<Fragment>> {
    let count = message.len().div_ceil(FRAGMENT_BODY_BYTES).max(1);
    if count > u8::MAX as usize {
        return Err(crate::types::SleipnirError::InvalidConfig(format!(
            "message of {} bytes exceeds the {}-fragment limit",
            message.len(),
            u8::MAX
        )));
    }
    let mut fragments = Vec::with_capacity(count);
    for index in 0..count {
        let mut body = [0u8; FRAGMENT_BODY_BYTES];
        let start = index * FRAGMENT_BODY_BYTES;
        let end = (start + FRAGMENT_BODY_BYTES).min(message.len());
        if start < message.len() {
            body[..end - start].copy_from_slice(&message[start..end]);
        }
        fragments.push(Fragment {
            seq_id,
            index: index as u8,
            count: count as u8,
            body,
        });
    }
    Ok(fragments)
}

/// Join fragment bodies back into a message, trimming the zero padding of
/// the final fragment. Fragments must be presented in index order.
pub fn join_fragments(fragments: &[Fragment]) -> Vec<u8> {
    let mut message: Vec<u8> = Vec::with_capacity(fragments.len() * FRAGMENT_BODY_BYTES);
    for fragment in fragments {
        message.extend_from_slice(&fragment.body);
    }
    while message.last() == Some(&0) {
        message.pop();
    }
    message
}

// ---------------------------------------------------------------------------
// Parse results
// ---------------------------------------------------------------------------

/// Frame-level parse failures. These become status events upstream; none of
/// them is session-fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParseError {
    /// Tag byte is not one of the legal values.
    UnknownTag(u8),
    /// Truncated MAC verification failed.
    MacInvalid,
    /// Sync payload structure is wrong despite a magic match.
    SyncMagicInvalid,
    /// Sync counter moved backwards inside the replay window.
    CounterReplay { last: u32, got: u32 },
    /// Fragment header is inconsistent.
    FragmentHeader { index: u8, count: u8 },
}

/// A successfully parsed frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedFrame {
    Voice {
        /// The 40-byte Opus frame (39 wire bytes, zero re-padded).
        opus: [u8; OPUS_FRAME_BYTES],
        /// `Some(true)` when a symmetric key verified the frame, `None` in
        /// plaintext mode.
        mac_valid: Option<bool>,
    },
    Aprs {
        fragment: Fragment,
        mac_valid: Option<bool>,
    },
    Text {
        fragment: Fragment,
        mac_valid: Option<bool>,
    },
    Sync {
        counter: u32,
    },
}

impl ParsedFrame {
    /// The logical tag of this frame.
    pub fn tag(&self) -> FrameTag {
        match self {
            ParsedFrame::Voice { .. } => FrameTag::Voice,
            ParsedFrame::Aprs { .. } => FrameTag::Aprs,
            ParsedFrame::Text { .. } => FrameTag::Text,
            ParsedFrame::Sync { .. } => FrameTag::Sync,
        }
    }

    /// The MAC verdict, when one applies.
    pub fn mac_valid(&self) -> Option<bool> {
        match self {
            ParsedFrame::Voice { mac_valid, .. }
            | ParsedFrame::Aprs { mac_valid, .. }
            | ParsedFrame::Text { mac_valid, .. } => *mac_valid,
            ParsedFrame::Sync { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Builds and parses the fixed-size frame payloads.
///
/// Carries the callsign bound into MAC AAD: the local callsign on the
/// transmit side, the expected sender on the receive side.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    callsign: Callsign,
}

impl FrameCodec {
    pub fn new(callsign: Callsign) -> Self {
        Self { callsign }
    }

    pub fn callsign(&self) -> Callsign {
        self.callsign
    }

    pub fn set_callsign(&mut self, callsign: Callsign) {
        self.callsign = callsign;
    }

    /// Assemble `tag || data || mac8` under the requested security mode.
    fn build_user_frame(
        &self,
        tag: FrameTag,
        data: &[u8; FRAME_DATA_BYTES],
        ctx: &FrameContext<'_>,
    ) -> Result<[u8; USER_PAYLOAD_BYTES]> {
        let mut payload = [0u8; USER_PAYLOAD_BYTES];
        payload[0] = tag.to_byte();

        match ctx.security {
            Security::Plaintext => {
                payload[1..1 + FRAME_DATA_BYTES].copy_from_slice(data);
                // mac8 stays zero: the frame is marked plaintext.
            }
            Security::Mac(keys) => {
                payload[1..1 + FRAME_DATA_BYTES].copy_from_slice(data);
                let nonce = derive_nonce(keys.nonce_base, ctx.counter, ctx.position);
                let mac_input = mac_only_input(tag, data, ctx.counter, ctx.position, self.callsign);
                let tag8 = keys.provider.mac_truncated(keys.key, &nonce, &mac_input)?;
                payload[1 + FRAME_DATA_BYTES..].copy_from_slice(&tag8);
            }
            Security::Encrypted(keys) => {
                let nonce = derive_nonce(keys.nonce_base, ctx.counter, ctx.position);
                let aad = frame_aad(ctx.counter, ctx.position, self.callsign);
                let (ciphertext, tag8) =
                    keys.provider.seal_truncated(keys.key, &nonce, &aad, data)?;
                payload[1..1 + FRAME_DATA_BYTES].copy_from_slice(&ciphertext);
                payload[1 + FRAME_DATA_BYTES..].copy_from_slice(&tag8);
            }
        }
        Ok(payload)
    }

    /// Build a voice payload from a 40-byte Opus frame.
    pub fn build_voice(
        &self,
        opus: &[u8; OPUS_FRAME_BYTES],
        ctx: &FrameContext<'_>,
    ) -> Result<[u8; USER_PAYLOAD_BYTES]> {
        let mut data = [0u8; FRAME_DATA_BYTES];
        data.copy_from_slice(&opus[..FRAME_DATA_BYTES]);
        self.build_user_frame(FrameTag::Voice, &data, ctx)
    }

    /// Build a text payload from one fragment.
    pub fn build_text(
        &self,
        fragment: &Fragment,
        ctx: &FrameContext<'_>,
    ) -> Result<[u8; USER_PAYLOAD_BYTES]> {
        self.build_user_frame(FrameTag::Text, &fragment.to_data(), ctx)
    }

    /// Build an APRS payload from one fragment.
    pub fn build_aprs(
        &self,
        fragment: &Fragment,
        ctx: &FrameContext<'_>,
    ) -> Result<[u8; USER_PAYLOAD_BYTES]> {
        self.build_user_frame(FrameTag::Aprs, &fragment.to_data(), ctx)
    }

    /// Build a sync payload for the given superframe counter. Sync frames
    /// are never MAC'd or encrypted.
    pub fn build_sync(&self, counter: u32) -> [u8; USER_PAYLOAD_BYTES] {
        let mut payload = [0u8; USER_PAYLOAD_BYTES];
        payload[..8].copy_from_slice(&SYNC_MAGIC);
        payload[8..12].copy_from_slice(&counter.to_be_bytes());
        // position_be32 and the tail stay zero.
        payload
    }

    /// Build the 32-byte auth payload from a truncated signature.
    pub fn build_auth(&self, signature: [u8; AUTH_PAYLOAD_BYTES]) -> [u8; AUTH_PAYLOAD_BYTES] {
        signature
    }

    /// Parse a 48-byte payload.
    ///
    /// Validation order: sync frames are recognized by the full 8-byte magic
    /// (they carry no tag byte), then the tag byte is checked for legality,
    /// then the truncated MAC is verified when a key is configured, and
    /// finally sync counters are checked for monotonicity against
    /// `last_counter` (equal counters are accepted idempotently; a decrement
    /// by less than half the range is a replay).
    pub fn parse(
        &self,
        payload: &[u8; USER_PAYLOAD_BYTES],
        ctx: &FrameContext<'_>,
        last_counter: Option<u32>,
    ) -> std::result::Result<ParsedFrame, FrameParseError> {
        if payload[..8] == SYNC_MAGIC {
            return self.parse_sync(payload, last_counter);
        }

        let tag = FrameTag::from_byte(payload[0]).ok_or(FrameParseError::UnknownTag(payload[0]))?;
        if tag == FrameTag::Sync {
            // A sync tag byte without the magic is not a sync frame.
            return Err(FrameParseError::SyncMagicInvalid);
        }

        let wire_data: &[u8] = &payload[1..1 + FRAME_DATA_BYTES];
        let mut tag8 = [0u8; WIRE_MAC_BYTES];
        tag8.copy_from_slice(&payload[1 + FRAME_DATA_BYTES..]);

        let (data, mac_valid) = match ctx.security {
            Security::Plaintext => {
                let mut data = [0u8; FRAME_DATA_BYTES];
                data.copy_from_slice(wire_data);
                (data, None)
            }
            Security::Mac(keys) => {
                let mut data = [0u8; FRAME_DATA_BYTES];
                data.copy_from_slice(wire_data);
                let nonce = derive_nonce(keys.nonce_base, ctx.counter, ctx.position);
                let mac_input = mac_only_input(tag, &data, ctx.counter, ctx.position, self.callsign);
                if !keys
                    .provider
                    .verify_mac_truncated(keys.key, &nonce, &mac_input, &tag8)
                {
                    return Err(FrameParseError::MacInvalid);
                }
                (data, Some(true))
            }
            Security::Encrypted(keys) => {
                let nonce = derive_nonce(keys.nonce_base, ctx.counter, ctx.position);
                let aad = frame_aad(ctx.counter, ctx.position, self.callsign);
                let plaintext = keys
                    .provider
                    .open_truncated(keys.key, &nonce, &aad, wire_data, &tag8)
                    .map_err(|_| FrameParseError::MacInvalid)?;
                let mut data = [0u8; FRAME_DATA_BYTES];
                data.copy_from_slice(&plaintext);
                (data, Some(true))
            }
        };

        match tag {
            FrameTag::Voice => {
                let mut opus = [0u8; OPUS_FRAME_BYTES];
                opus[..FRAME_DATA_BYTES].copy_from_slice(&data);
                Ok(ParsedFrame::Voice { opus, mac_valid })
            }
            FrameTag::Aprs => Ok(ParsedFrame::Aprs {
                fragment: Fragment::from_data(&data)?,
                mac_valid,
            }),
            FrameTag::Text => Ok(ParsedFrame::Text {
                fragment: Fragment::from_data(&data)?,
                mac_valid,
            }),
            FrameTag::Sync => unreachable!("sync handled above"),
        }
    }

    fn parse_sync(
        &self,
        payload: &[u8; USER_PAYLOAD_BYTES],
        last_counter: Option<u32>,
    ) -> std::result::Result<ParsedFrame, FrameParseError> {
        let counter = u32::from_be_bytes([payload[8], payload[9], payload[10], payload[11]]);
        let position = u32::from_be_bytes([payload[12], payload[13], payload[14], payload[15]]);
        if position != 0 {
            return Err(FrameParseError::SyncMagicInvalid);
        }
        if let Some(last) = last_counter {
            let delta = counter.wrapping_sub(last);
            // delta 0 is an idempotent re-acquisition; forward deltas up to
            // half the range advance; anything else went backwards.
            if delta >= 1 << 31 {
                return Err(FrameParseError::CounterReplay { last, got: counter });
            }
        }
        Ok(ParsedFrame::Sync { counter })
    }
}

/// MAC-only mode input: `tag || data || AAD(counter, position, callsign)`.
fn mac_only_input(
    tag: FrameTag,
    data: &[u8; FRAME_DATA_BYTES],
    counter: u32,
    position: u8,
    callsign: Callsign,
) -> Vec<u8> {
    let mut input = Vec::with_capacity(1 + FRAME_DATA_BYTES + 10);
    input.push(tag.to_byte());
    input.extend_from_slice(data);
    input.extend_from_slice(&frame_aad(counter, position, callsign));
    input
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
