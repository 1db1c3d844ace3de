//! Pipeline harness: threads wiring the bus to the superframe engines.
//!
//! Four logical tasks exist per direction; this module owns the superframe
//! task for each and the trait seams the external collaborators plug into:
//!
//! - [`VoiceCodec`]: the Opus encoder/decoder (8 kHz mono f32 in, fixed
//!   40-byte frames out).
//! - [`ModemSink`] / [`ModemSource`]: the FSK modulator and demodulator,
//!   exchanging codewords with an explicit bit-length sideband.
//!
//! The superframe tasks are plain worker threads draining typed queues;
//! there are no cross-component callbacks. Cancellation is cooperative: on
//! request the transmit task flushes the superframe in progress and both
//! tasks wind down within one superframe period.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::assembler::{EncodedFrame, SuperframeAssembler};
use crate::bus::MessageBus;
use crate::parser::{RxEvent, SuperframeParser};
use crate::types::{
    Result, SleipnirError, StatusEvent, StatusKind, FRAMES_PER_SUPERFRAME, FRAME_DURATION_MS,
    OPUS_FRAME_BYTES,
};

/// PCM samples per Opus frame (8 kHz mono, 40 ms).
pub const PCM_SAMPLES_PER_FRAME: usize = 320;

/// Default wall-clock length of one superframe.
pub const SUPERFRAME_PERIOD: Duration =
    Duration::from_millis(FRAME_DURATION_MS * FRAMES_PER_SUPERFRAME as u64);

// ---------------------------------------------------------------------------
// External collaborator seams
// ---------------------------------------------------------------------------

/// The audio codec contract: 40 ms of 8 kHz mono f32 audio per fixed
/// 40-byte frame. The engine treats the frame as an opaque blob.
pub trait VoiceCodec: Send {
    fn encode(&mut self, pcm: &[f32]) -> Result<[u8; OPUS_FRAME_BYTES]>;
    fn decode(&mut self, frame: &[u8; OPUS_FRAME_BYTES]) -> Result<Vec<f32>>;
}

/// Stand-in codec for loopback and tests: silence maps to the null frame
/// (40 zero bytes) and non-silent audio to a deterministic marker frame.
#[derive(Debug, Default)]
pub struct NullOpus;

impl VoiceCodec for NullOpus {
    fn encode(&mut self, pcm: &[f32]) -> Result<[u8; OPUS_FRAME_BYTES]> {
        let mut frame = [0u8; OPUS_FRAME_BYTES];
        for (slot, chunk) in frame.iter_mut().zip(pcm.chunks(8)) {
            let energy: f32 = chunk.iter().map(|s| s.abs()).sum();
            *slot = (energy.min(1.0) * 255.0) as u8;
        }
        Ok(frame)
    }

    fn decode(&mut self, frame: &[u8; OPUS_FRAME_BYTES]) -> Result<Vec<f32>> {
        Ok(frame
            .iter()
            .flat_map(|&b| std::iter::repeat(f32::from(b) / 255.0).take(8))
            .collect())
    }
}

/// Downstream modulator: consumes codewords in superframe order, with the
/// bit length of each frame as the explicit sideband.
pub trait ModemSink: Send {
    fn push_frame(&mut self, frame: &EncodedFrame) -> Result<()>;
}

/// Upstream demodulator: delivers hard-decision codewords with boundary
/// markers. `None` means the stream ended.
pub trait ModemSource: Send {
    fn next_codeword(&mut self) -> Option<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation shared with the pipeline threads.
///
/// Plain cancellation drains: the transmit task flushes the superframe in
/// progress before exiting. Hard cancellation aborts without the flush.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    hard: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel with drain semantics.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Cancel without draining the superframe in progress.
    pub fn cancel_hard(&self) {
        self.hard.store(true, Ordering::SeqCst);
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn is_hard_cancelled(&self) -> bool {
        self.hard.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Audio helpers
// ---------------------------------------------------------------------------

/// Encode a PCM buffer into Opus frames and feed them to `audio_in`
/// (blocking on the queue: transmit audio back-pressures the encoder).
/// Returns the number of frames produced; a trailing partial frame is
/// zero-padded.
pub fn run_voice_encoder<C: VoiceCodec>(
    codec: &mut C,
    pcm: &[f32],
    bus: &MessageBus,
) -> Result<usize> {
    let mut produced = 0;
    for chunk in pcm.chunks(PCM_SAMPLES_PER_FRAME) {
        let frame = if chunk.len() == PCM_SAMPLES_PER_FRAME {
            codec.encode(chunk)?
        } else {
            let mut padded = vec![0.0f32; PCM_SAMPLES_PER_FRAME];
            padded[..chunk.len()].copy_from_slice(chunk);
            codec.encode(&padded)?
        };
        bus.audio_in.push(crate::bus::AudioFrame(frame))?;
        produced += 1;
    }
    Ok(produced)
}

// ---------------------------------------------------------------------------
// Transmit pipeline
// ---------------------------------------------------------------------------

/// The transmit superframe task.
pub struct TxPipeline {
    handle: Option<JoinHandle<Result<()>>>,
    token: CancellationToken,
}

impl TxPipeline {
    /// Spawn with the standard one-second superframe period.
    pub fn spawn<S: ModemSink + 'static>(
        assembler: SuperframeAssembler,
        bus: Arc<MessageBus>,
        sink: S,
    ) -> Self {
        Self::spawn_with_period(assembler, bus, sink, SUPERFRAME_PERIOD)
    }

    /// Spawn with an explicit superframe period (loopback tests run much
    /// faster than wall-clock air time).
    pub fn spawn_with_period<S: ModemSink + 'static>(
        mut assembler: SuperframeAssembler,
        bus: Arc<MessageBus>,
        mut sink: S,
        period: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let handle = std::thread::Builder::new()
            .name("sleipnir-tx".into())
            .spawn(move || tx_loop(&mut assembler, &bus, &mut sink, &thread_token, period))
            .expect("spawning the tx thread");
        Self {
            handle: Some(handle),
            token,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Request cancellation and wait for the drain to finish.
    pub fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(SleipnirError::SessionLifecycle("tx thread panicked"))),
            None => Ok(()),
        }
    }

    /// Abort without flushing the superframe in progress.
    pub fn abort(mut self) -> Result<()> {
        self.token.cancel_hard();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(SleipnirError::SessionLifecycle("tx thread panicked"))),
            None => Ok(()),
        }
    }
}

fn tx_loop<S: ModemSink>(
    assembler: &mut SuperframeAssembler,
    bus: &MessageBus,
    sink: &mut S,
    token: &CancellationToken,
    period: Duration,
) -> Result<()> {
    loop {
        if let Err(err) = apply_bus_directives(assembler, bus) {
            report_fatal(bus, &err);
            return Err(err);
        }

        // Collect one superframe of audio: the 24th Opus frame or the tick
        // deadline, whichever comes first. Waits are sliced so cancellation
        // stays responsive.
        let deadline = Instant::now() + period;
        let mut collected = 0;
        while collected < 24 {
            if token.is_cancelled() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = (deadline - now).min(Duration::from_millis(50));
            match bus.audio_in.pop_timeout(wait) {
                Some(frame) => {
                    assembler.push_voice(frame.0);
                    collected += 1;
                }
                None if bus.audio_in.is_closed() => break,
                None => {}
            }
        }

        if token.is_hard_cancelled() {
            return Ok(());
        }

        // Text and APRS move over whenever a superframe is about to form.
        for message in bus.text_in.drain() {
            assembler.push_text(&message.bytes)?;
        }
        for packet in bus.aprs_in.drain() {
            assembler.push_aprs(&packet.bytes)?;
        }

        let draining = token.is_cancelled();
        if draining {
            assembler.ptt_released();
        }

        match assembler.tick() {
            Ok(Some(superframe)) => {
                for frame in &superframe.frames {
                    sink.push_frame(frame)?;
                }
            }
            Ok(None) => {
                if draining {
                    return Ok(());
                }
            }
            Err(err) => {
                report_fatal(bus, &err);
                return Err(err);
            }
        }
        if draining {
            return Ok(());
        }
    }
}

fn apply_bus_directives(assembler: &mut SuperframeAssembler, bus: &MessageBus) -> Result<()> {
    for key_event in bus.keys.drain() {
        assembler.apply_directive(key_event.into_directive())?;
    }
    while let Some(directive) = bus.ctrl.try_pop() {
        assembler.apply_directive(directive)?;
    }
    Ok(())
}

fn report_fatal(bus: &MessageBus, err: &SleipnirError) {
    tracing::error!(error = %err, "session-fatal error, closing");
    let _ = bus.status_out.push(StatusEvent {
        superframe_counter: 0,
        position: 0,
        kind: StatusKind::SessionFatal,
        signature_valid: None,
        mac_valid: None,
        decoder_converged: false,
        syndrome_residual: 0,
        decoder_type: crate::types::DecoderType::HardBitFlip,
        sender_callsign: None,
        sync_state: crate::types::SyncState::Lost,
        frames_received: 0,
        frame_errors: 0,
    });
}

// ---------------------------------------------------------------------------
// Receive pipeline
// ---------------------------------------------------------------------------

/// The receive superframe task.
pub struct RxPipeline {
    handle: Option<JoinHandle<Result<()>>>,
    token: CancellationToken,
}

impl RxPipeline {
    pub fn spawn<S: ModemSource + 'static>(
        parser: SuperframeParser,
        bus: Arc<MessageBus>,
        source: S,
    ) -> Self {
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let mut parser = parser;
        let mut source = source;
        let handle = std::thread::Builder::new()
            .name("sleipnir-rx".into())
            .spawn(move || rx_loop(&mut parser, &bus, &mut source, &thread_token))
            .expect("spawning the rx thread");
        Self {
            handle: Some(handle),
            token,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or(Err(SleipnirError::SessionLifecycle("rx thread panicked"))),
            None => Ok(()),
        }
    }
}

fn rx_loop<S: ModemSource>(
    parser: &mut SuperframeParser,
    bus: &MessageBus,
    source: &mut S,
    token: &CancellationToken,
) -> Result<()> {
    while !token.is_cancelled() {
        for key_event in bus.keys.drain() {
            if let Err(err) = parser.apply_directive(key_event.into_directive()) {
                report_fatal(bus, &err);
                return Err(err);
            }
        }
        while let Some(directive) = bus.ctrl.try_pop() {
            if let Err(err) = parser.apply_directive(directive) {
                report_fatal(bus, &err);
                return Err(err);
            }
        }

        let Some(codeword) = source.next_codeword() else {
            return Ok(());
        };
        for event in parser.feed_codeword(&codeword) {
            dispatch_event(bus, event);
        }
    }
    Ok(())
}

fn dispatch_event(bus: &MessageBus, event: RxEvent) {
    let result = match event {
        RxEvent::Voice(voice) => bus.audio_out.push(voice).map(|_| ()),
        RxEvent::Text(message) => bus.text_out.push(message).map(|_| ()),
        RxEvent::Aprs(packet) => bus.aprs_out.push(packet).map(|_| ()),
        RxEvent::Status(status) => bus.status_out.push(status).map(|_| ()),
    };
    if result.is_err() {
        tracing::debug!("output queue closed, event dropped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BoundedQueue, OverflowPolicy};
    use crate::ldpc::LdpcCodec;
    use crate::session::{ControlDirective, SessionConfig};

    /// In-memory codeword channel standing in for the modem pair.
    struct LoopbackAir {
        queue: Arc<BoundedQueue<Vec<u8>>>,
    }

    impl LoopbackAir {
        fn pair() -> (LoopbackAir, LoopbackAir) {
            let queue = Arc::new(BoundedQueue::new("air", 4096, OverflowPolicy::Block));
            (
                LoopbackAir {
                    queue: Arc::clone(&queue),
                },
                LoopbackAir { queue },
            )
        }
    }

    impl ModemSink for LoopbackAir {
        fn push_frame(&mut self, frame: &EncodedFrame) -> Result<()> {
            self.queue.push(frame.bits.clone())
        }
    }

    impl ModemSource for LoopbackAir {
        fn next_codeword(&mut self) -> Option<Vec<u8>> {
            self.queue.pop_timeout(Duration::from_millis(200))
        }
    }

    fn codecs() -> (Arc<LdpcCodec>, Arc<LdpcCodec>) {
        let auth = LdpcCodec::from_alist_str(include_str!(
            "../ldpc_matrices/ldpc_auth_768_256.alist"
        ))
        .unwrap();
        let voice = LdpcCodec::from_alist_str(include_str!(
            "../ldpc_matrices/ldpc_voice_576_384.alist"
        ))
        .unwrap();
        (Arc::new(auth), Arc::new(voice))
    }

    fn engine_pair() -> (SuperframeAssembler, SuperframeParser) {
        let (auth, voice) = codecs();
        let mut tx = SuperframeAssembler::new(
            SessionConfig::default().build().unwrap(),
            Arc::clone(&auth),
            Arc::clone(&voice),
        );
        tx.ptt_pressed();
        let rx = SuperframeParser::new(SessionConfig::default().build().unwrap(), auth, voice);
        (tx, rx)
    }

    #[test]
    fn test_null_opus_codec_contract() {
        let mut codec = NullOpus;
        let silence = vec![0.0f32; PCM_SAMPLES_PER_FRAME];
        let frame = codec.encode(&silence).unwrap();
        assert_eq!(frame, [0u8; OPUS_FRAME_BYTES], "silence is the null frame");
        let pcm = codec.decode(&frame).unwrap();
        assert_eq!(pcm.len(), PCM_SAMPLES_PER_FRAME);
        assert!(pcm.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_run_voice_encoder_paces_through_bus() {
        let bus = MessageBus::new();
        let mut codec = NullOpus;
        // Two superframes of silence, minus one frame.
        let pcm = vec![0.0f32; PCM_SAMPLES_PER_FRAME * 23];
        let produced = run_voice_encoder(&mut codec, &pcm, &bus).unwrap();
        assert_eq!(produced, 23);
        assert_eq!(bus.audio_in.len(), 23);
    }

    #[test]
    fn test_loopback_voice_end_to_end() {
        let (tx_engine, rx_engine) = engine_pair();
        let (sink, source) = LoopbackAir::pair();
        let tx_bus = Arc::new(MessageBus::new());
        let rx_bus = Arc::new(MessageBus::new());

        // One superframe of audio, pre-queued.
        for _ in 0..24 {
            tx_bus
                .audio_in
                .push(crate::bus::AudioFrame([0u8; OPUS_FRAME_BYTES]))
                .unwrap();
        }

        let tx = TxPipeline::spawn_with_period(
            tx_engine,
            Arc::clone(&tx_bus),
            sink,
            Duration::from_millis(50),
        );
        let rx = RxPipeline::spawn(rx_engine, Arc::clone(&rx_bus), source);

        // Wait for the decoded voice to come out the far side.
        let mut voices = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while voices.len() < 24 && Instant::now() < deadline {
            if let Some(v) = rx_bus.audio_out.pop_timeout(Duration::from_millis(100)) {
                voices.push(v);
            }
        }
        tx.shutdown().unwrap();
        rx.shutdown().unwrap();

        assert_eq!(voices.len(), 24);
        assert!(voices.iter().all(|v| v.opus == [0u8; OPUS_FRAME_BYTES]));
        let statuses = rx_bus.status_out.drain();
        assert!(statuses
            .iter()
            .any(|s| s.kind == StatusKind::SyncAcquired));
        assert!(!statuses.iter().any(|s| s.kind == StatusKind::MacInvalid));
    }

    #[test]
    fn test_loopback_text_with_ctrl_directives() {
        let (tx_engine, rx_engine) = engine_pair();
        let (sink, source) = LoopbackAir::pair();
        let tx_bus = Arc::new(MessageBus::new());
        let rx_bus = Arc::new(MessageBus::new());

        // Reconfigure both ends over their ctrl queues before traffic.
        tx_bus
            .ctrl
            .push(ControlDirective::LocalCallsign {
                callsign: "W1AW".into(),
            })
            .unwrap();
        rx_bus
            .ctrl
            .push(ControlDirective::Recipients {
                callsigns: vec!["W1AW".into()],
            })
            .unwrap();

        tx_bus
            .text_in
            .push(crate::bus::OutboundMessage {
                bytes: b"CQ CQ de W1AW".to_vec(),
            })
            .unwrap();

        let tx = TxPipeline::spawn_with_period(
            tx_engine,
            Arc::clone(&tx_bus),
            sink,
            Duration::from_millis(30),
        );
        let rx = RxPipeline::spawn(rx_engine, Arc::clone(&rx_bus), source);

        let message = {
            let deadline = Instant::now() + Duration::from_secs(5);
            let mut found = None;
            while found.is_none() && Instant::now() < deadline {
                found = rx_bus.text_out.pop_timeout(Duration::from_millis(100));
            }
            found
        };
        tx.shutdown().unwrap();
        rx.shutdown().unwrap();

        let message = message.expect("text message should arrive");
        assert_eq!(message.bytes, b"CQ CQ de W1AW");
        assert_eq!(message.sender.unwrap().to_string(), "W1AW");
    }

    #[test]
    fn test_shutdown_drains_within_a_superframe() {
        let (tx_engine, _) = engine_pair();
        let (sink, _source) = LoopbackAir::pair();
        let bus = Arc::new(MessageBus::new());

        let tx = TxPipeline::spawn_with_period(
            tx_engine,
            Arc::clone(&bus),
            sink,
            Duration::from_millis(40),
        );
        std::thread::sleep(Duration::from_millis(10));
        let start = Instant::now();
        tx.shutdown().unwrap();
        // Cancellation completes within roughly one superframe period.
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_abort_skips_the_drain_tick() {
        let (tx_engine, _) = engine_pair();
        let (sink, source) = LoopbackAir::pair();
        let bus = Arc::new(MessageBus::new());

        // A long period keeps the task waiting for audio when we abort.
        let tx = TxPipeline::spawn_with_period(
            tx_engine,
            Arc::clone(&bus),
            sink,
            Duration::from_millis(300),
        );
        std::thread::sleep(Duration::from_millis(30));
        tx.abort().unwrap();
        // No superframe was flushed on the way out.
        let mut drop_source = source;
        assert!(drop_source.next_codeword().is_none());
    }

    #[test]
    fn test_fatal_directive_closes_session_with_status() {
        let (tx_engine, _) = engine_pair();
        let (sink, _source) = LoopbackAir::pair();
        let bus = Arc::new(MessageBus::new());
        bus.ctrl
            .push(ControlDirective::MacKey { key: vec![0; 7] })
            .unwrap();

        let tx = TxPipeline::spawn_with_period(
            tx_engine,
            Arc::clone(&bus),
            sink,
            Duration::from_millis(30),
        );
        let err = tx.shutdown();
        assert!(err.is_err());
        let statuses = bus.status_out.drain();
        assert!(statuses.iter().any(|s| s.kind == StatusKind::SessionFatal));
    }
}
