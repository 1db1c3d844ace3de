//! Superframe assembly (transmit core).
//!
//! The assembler owns the outgoing frame schedule. Once per tick (the
//! caller drives it every second, or as soon as the 25th Opus frame lands)
//! it composes one 25-frame superframe:
//!
//! 1. Position 0 carries an auth frame (signing on), a sync frame (counter
//!    on the sync interval), or one more user slot.
//! 2. Remaining slots pop queued frames in priority order
//!    APRS > text > voice; silence fills an empty schedule.
//! 3. User frames get the session's MAC/AEAD treatment with the
//!    counter/position-derived nonce.
//! 4. Every payload is LDPC-encoded through the router's matrix choice.
//! 5. The 25 codewords go downstream in position order and the counter
//!    increments (mod 2^32).
//!
//! Voice never preempts text or APRS: the voice queue is the only one that
//! overwrites itself under pressure.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::crypto::{superframe_digest, CryptoProvider};
use crate::frame::{split_message, FrameCodec, FrameContext, Fragment};
use crate::ldpc::LdpcCodec;
use crate::router::{FrameRouter, MatrixSel, Position0};
use crate::session::{ControlDirective, SessionState};
use crate::types::{
    FrameTag, Result, SleipnirError, FRAMES_PER_SUPERFRAME, OPUS_FRAME_BYTES, USER_PAYLOAD_BYTES,
};

/// Realtime bound on queued voice frames (one superframe of audio).
const VOICE_QUEUE_FRAMES: usize = 24;

/// Bound on pending text/APRS fragments before whole old messages drop.
const MAX_PENDING_FRAGMENTS: usize = 256;

// ---------------------------------------------------------------------------
// Output types
// ---------------------------------------------------------------------------

/// One LDPC-encoded frame with its length sideband for the modulator.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    /// Position in the superframe, 0-24.
    pub position: u8,
    /// Logical content kind (`None` for the auth frame, which has no tag).
    pub tag: Option<FrameTag>,
    /// The payload exactly as protected and transmitted (32 or 48 bytes).
    pub payload: Vec<u8>,
    /// Codeword bits, one bit per element, MSB-first per payload byte.
    pub bits: Vec<u8>,
}

impl EncodedFrame {
    /// The explicit frame-length sideband (768 or 576 bits).
    pub fn bit_len(&self) -> usize {
        self.bits.len()
    }
}

/// One assembled superframe.
#[derive(Debug, Clone)]
pub struct SuperframeOut {
    pub counter: u32,
    pub frames: Vec<EncodedFrame>,
}

/// Transmit lifecycle, driven by PTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxLifecycle {
    /// No transmission scheduled; ticks produce nothing.
    Idle,
    /// PTT held; ticks produce superframes.
    Active,
    /// PTT released mid-superframe; the current superframe flushes, then
    /// the assembler idles.
    Draining,
}

// ---------------------------------------------------------------------------
// Assembler
// ---------------------------------------------------------------------------

/// The transmit-side superframe state machine.
pub struct SuperframeAssembler {
    session: SessionState,
    provider: Arc<CryptoProvider>,
    auth_ldpc: Arc<LdpcCodec>,
    voice_ldpc: Arc<LdpcCodec>,
    frame_codec: FrameCodec,
    counter: u32,
    lifecycle: TxLifecycle,
    voice_q: VecDeque<[u8; OPUS_FRAME_BYTES]>,
    text_q: VecDeque<Fragment>,
    aprs_q: VecDeque<Fragment>,
    next_seq_id: u8,
}

impl SuperframeAssembler {
    pub fn new(
        mut session: SessionState,
        auth_ldpc: Arc<LdpcCodec>,
        voice_ldpc: Arc<LdpcCodec>,
    ) -> Self {
        if session.lifecycle == crate::session::Lifecycle::Init {
            // A freshly built session starts running when handed to the
            // engine.
            let _ = session.begin();
        }
        let frame_codec = FrameCodec::new(session.local_callsign);
        Self {
            session,
            provider: Arc::new(CryptoProvider::new()),
            auth_ldpc,
            voice_ldpc,
            frame_codec,
            counter: 0,
            lifecycle: TxLifecycle::Idle,
            voice_q: VecDeque::with_capacity(VOICE_QUEUE_FRAMES),
            text_q: VecDeque::new(),
            aprs_q: VecDeque::new(),
            next_seq_id: 0,
        }
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Seed the superframe counter (session handover, tests).
    pub fn set_counter(&mut self, counter: u32) {
        self.counter = counter;
    }

    pub fn lifecycle(&self) -> TxLifecycle {
        self.lifecycle
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Apply a control directive to the running session.
    pub fn apply_directive(&mut self, directive: ControlDirective) -> Result<()> {
        self.session.apply(directive, &self.provider)?;
        self.frame_codec.set_callsign(self.session.local_callsign);
        Ok(())
    }

    /// PTT engaged: start producing superframes.
    pub fn ptt_pressed(&mut self) {
        if self.lifecycle == TxLifecycle::Idle {
            tracing::debug!("ptt pressed, assembler active");
            self.lifecycle = TxLifecycle::Active;
        }
    }

    /// PTT released: flush the superframe in progress, then idle.
    pub fn ptt_released(&mut self) {
        if self.lifecycle == TxLifecycle::Active {
            tracing::debug!("ptt released, draining");
            self.lifecycle = TxLifecycle::Draining;
        }
    }

    /// Queue one Opus frame. The voice queue is realtime: under pressure
    /// the oldest frame is overwritten rather than delaying newer audio.
    pub fn push_voice(&mut self, opus: [u8; OPUS_FRAME_BYTES]) {
        if self.voice_q.len() >= VOICE_QUEUE_FRAMES {
            self.voice_q.pop_front();
        }
        self.voice_q.push_back(opus);
    }

    /// Queue a text message; returns its fragment sequence id.
    pub fn push_text(&mut self, message: &[u8]) -> Result<u8> {
        let seq = self.take_seq_id();
        let fragments = split_message(seq, message)?;
        Self::enqueue_fragments(&mut self.text_q, fragments);
        Ok(seq)
    }

    /// Queue an APRS packet; returns its fragment sequence id.
    pub fn push_aprs(&mut self, packet: &[u8]) -> Result<u8> {
        let seq = self.take_seq_id();
        let fragments = split_message(seq, packet)?;
        Self::enqueue_fragments(&mut self.aprs_q, fragments);
        Ok(seq)
    }

    fn take_seq_id(&mut self) -> u8 {
        let seq = self.next_seq_id;
        self.next_seq_id = self.next_seq_id.wrapping_add(1);
        seq
    }

    /// FIFO enqueue with whole-message eviction under overflow: fragments
    /// of one message must stay consecutive, so eviction removes the
    /// entire run at the queue front.
    fn enqueue_fragments(queue: &mut VecDeque<Fragment>, fragments: Vec<Fragment>) {
        while queue.len() + fragments.len() > MAX_PENDING_FRAGMENTS {
            let Some(front) = queue.front().copied() else {
                break;
            };
            tracing::warn!(seq_id = front.seq_id, "message queue overflow, evicting oldest");
            while queue
                .front()
                .is_some_and(|f| f.seq_id == front.seq_id)
            {
                queue.pop_front();
            }
        }
        queue.extend(fragments);
    }

    /// Pop the highest-priority pending frame for one user slot.
    fn pop_user_slot(&mut self) -> (FrameTag, UserSlot) {
        if let Some(fragment) = self.aprs_q.pop_front() {
            return (FrameTag::Aprs, UserSlot::Fragment(fragment));
        }
        if let Some(fragment) = self.text_q.pop_front() {
            return (FrameTag::Text, UserSlot::Fragment(fragment));
        }
        if let Some(opus) = self.voice_q.pop_front() {
            return (FrameTag::Voice, UserSlot::Opus(opus));
        }
        // Nothing queued: a null Opus frame keeps the schedule full.
        (FrameTag::Voice, UserSlot::Opus([0u8; OPUS_FRAME_BYTES]))
    }

    /// Assemble one superframe, or `None` while idle.
    pub fn tick(&mut self) -> Result<Option<SuperframeOut>> {
        if self.lifecycle == TxLifecycle::Idle {
            return Ok(None);
        }

        let counter = self.counter;
        let policy = self.session.policy();
        let position0 =
            FrameRouter::position0(policy, counter, self.session.sync_interval);

        let first_user_position: u8 = match position0 {
            Position0::Auth | Position0::Sync => 1,
            Position0::UserData => 0,
        };

        // Build the user payloads first: the auth frame signs them
        // as-transmitted, after any encryption.
        let mut user_frames: Vec<(u8, FrameTag, [u8; USER_PAYLOAD_BYTES])> = Vec::new();
        for position in first_user_position..FRAMES_PER_SUPERFRAME as u8 {
            let (tag, slot) = self.pop_user_slot();
            let ctx = FrameContext {
                counter,
                position,
                security: self.session.security(&self.provider),
            };
            let payload = match slot {
                UserSlot::Opus(opus) => self.frame_codec.build_voice(&opus, &ctx)?,
                UserSlot::Fragment(fragment) => match tag {
                    FrameTag::Aprs => self.frame_codec.build_aprs(&fragment, &ctx)?,
                    _ => self.frame_codec.build_text(&fragment, &ctx)?,
                },
            };
            user_frames.push((position, tag, payload));
        }

        let mut frames: Vec<EncodedFrame> = Vec::with_capacity(FRAMES_PER_SUPERFRAME);

        match position0 {
            Position0::Auth => {
                let signing_key = self.session.signing_key.as_ref().ok_or(
                    SleipnirError::SessionLifecycle("signing enabled without a private key"),
                )?;
                let digest =
                    superframe_digest(user_frames.iter().map(|(_, _, p)| p.as_slice()));
                let signature = signing_key.sign32(&digest)?;
                let payload = self.frame_codec.build_auth(signature);
                frames.push(self.encode_frame(0, None, &payload, MatrixSel::Auth)?);
            }
            Position0::Sync => {
                let payload = self.frame_codec.build_sync(counter);
                frames.push(self.encode_frame(
                    0,
                    Some(FrameTag::Sync),
                    &payload,
                    MatrixSel::Voice,
                )?);
            }
            Position0::UserData => {}
        }

        for (position, tag, payload) in &user_frames {
            let route = FrameRouter::route_tx(*position, Some(*tag), policy);
            frames.push(self.encode_frame(*position, Some(*tag), payload, route.matrix)?);
        }

        debug_assert_eq!(frames.len(), FRAMES_PER_SUPERFRAME);
        self.counter = self.counter.wrapping_add(1);

        if self.lifecycle == TxLifecycle::Draining {
            tracing::debug!(counter, "drain complete, assembler idle");
            self.lifecycle = TxLifecycle::Idle;
        }
        tracing::debug!(counter, position0 = ?position0, "superframe assembled");

        Ok(Some(SuperframeOut { counter, frames }))
    }

    fn encode_frame(
        &self,
        position: u8,
        tag: Option<FrameTag>,
        payload: &[u8],
        matrix: MatrixSel,
    ) -> Result<EncodedFrame> {
        let ldpc = match matrix {
            MatrixSel::Auth => &self.auth_ldpc,
            MatrixSel::Voice => &self.voice_ldpc,
        };
        let bits = ldpc.encode_bytes(payload)?;
        Ok(EncodedFrame {
            position,
            tag,
            payload: payload.to_vec(),
            bits,
        })
    }
}

enum UserSlot {
    Opus([u8; OPUS_FRAME_BYTES]),
    Fragment(Fragment),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
