//! Typed bounded queues: the only cross-thread boundary the core exposes.
//!
//! Each queue has one producer and one consumer and a fixed overflow
//! policy. Transmit audio blocks (that back-pressure paces the encoder),
//! text and APRS drop their oldest entries, and key material replaces
//! whatever was still pending. The asymmetry is deliberate: voice
//! continuity wins over message delivery.
//!
//! | queue      | element             | bound | overflow    |
//! |------------|---------------------|-------|-------------|
//! | audio_in   | 40-byte Opus frame  | 24    | block       |
//! | text_in    | outbound message    | 64    | drop oldest |
//! | aprs_in    | outbound packet     | 64    | drop oldest |
//! | ctrl       | control directive   | 16    | block       |
//! | keys       | key-material event  | 4     | replace     |
//! | audio_out  | decoded voice       | 24    | drop oldest |
//! | text_out   | inbound message     | 64    | drop oldest |
//! | aprs_out   | inbound packet      | 64    | drop oldest |
//! | status_out | status event        | 128   | drop oldest |

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::session::ControlDirective;
use crate::types::{Callsign, FrameTag, Result, SleipnirError, StatusEvent, OPUS_FRAME_BYTES};

// ---------------------------------------------------------------------------
// Queue elements
// ---------------------------------------------------------------------------

/// One Opus frame headed for the assembler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFrame(pub [u8; OPUS_FRAME_BYTES]);

/// An outbound text message or APRS packet, fragmented by the assembler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub bytes: Vec<u8>,
}

/// A decoded voice frame with its provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedVoice {
    pub opus: [u8; OPUS_FRAME_BYTES],
    pub sender: Option<Callsign>,
    pub counter: u32,
    pub position: u8,
}

/// A reassembled inbound text message or APRS packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub bytes: Vec<u8>,
    pub sender: Option<Callsign>,
    pub counter: u32,
    pub kind: FrameTag,
}

/// Key material delivered outside the config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    MacKey(Vec<u8>),
    NonceBase(Vec<u8>),
    PrivateKey(Vec<u8>),
    PublicKey { callsign: String, key: Vec<u8> },
}

impl KeyEvent {
    /// The equivalent control directive.
    pub fn into_directive(self) -> ControlDirective {
        match self {
            KeyEvent::MacKey(key) => ControlDirective::MacKey { key },
            KeyEvent::NonceBase(bytes) => ControlDirective::NonceBase { bytes },
            KeyEvent::PrivateKey(key) => ControlDirective::PrivateKey { key },
            KeyEvent::PublicKey { callsign, key } => {
                ControlDirective::PublicKey { callsign, key }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bounded queue
// ---------------------------------------------------------------------------

/// Overflow behaviour when a push meets a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Producer waits for space (back-pressure).
    Block,
    /// Oldest entry is discarded to make room.
    DropOldest,
    /// Pending entries are discarded wholesale; latest wins.
    Replace,
}

#[derive(Debug)]
struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
    sent: u64,
    dropped: u64,
}

/// A bounded single-producer single-consumer queue with an explicit
/// overflow policy and sent/dropped accounting.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    name: &'static str,
    capacity: usize,
    policy: OverflowPolicy,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(name: &'static str, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            policy,
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                sent: 0,
                dropped: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an item according to the overflow policy.
    ///
    /// `Block` waits for space; the other policies never wait. Returns
    /// [`SleipnirError::QueueClosed`] once the queue has been closed.
    pub fn push(&self, item: T) -> Result<()> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(SleipnirError::QueueClosed(self.name));
        }
        match self.policy {
            OverflowPolicy::Block => {
                while inner.queue.len() >= self.capacity {
                    inner = self
                        .not_full
                        .wait(inner)
                        .unwrap_or_else(PoisonError::into_inner);
                    if inner.closed {
                        return Err(SleipnirError::QueueClosed(self.name));
                    }
                }
            }
            OverflowPolicy::DropOldest => {
                if inner.queue.len() >= self.capacity {
                    inner.queue.pop_front();
                    inner.dropped += 1;
                    if inner.dropped == 1 {
                        tracing::warn!(queue = self.name, "queue overflow, dropping oldest");
                    }
                }
            }
            OverflowPolicy::Replace => {
                let stale = inner.queue.len() as u64;
                if stale > 0 {
                    inner.queue.clear();
                    inner.dropped += stale;
                }
            }
        }
        inner.queue.push_back(item);
        inner.sent += 1;
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking dequeue.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        let item = inner.queue.pop_front();
        if item.is_some() {
            drop(inner);
            self.not_full.notify_one();
        }
        item
    }

    /// Blocking dequeue; `None` once the queue is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .not_empty
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Dequeue with a timeout; `None` on timeout or on closed-and-drained.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                drop(inner);
                self.not_full.notify_one();
                return Some(item);
            }
            if inner.closed {
                return None;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, timed_out) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
            if timed_out.timed_out() && inner.queue.is_empty() {
                return None;
            }
        }
    }

    /// Drain everything currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        let mut inner = self.lock();
        let items: Vec<T> = inner.queue.drain(..).collect();
        if !items.is_empty() {
            drop(inner);
            self.not_full.notify_one();
        }
        items
    }

    /// Close the queue: producers fail, consumers drain what remains.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Total items accepted.
    pub fn sent(&self) -> u64 {
        self.lock().sent
    }

    /// Total items discarded by overflow.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

/// The full queue set for one engine instance (both directions).
#[derive(Debug)]
pub struct MessageBus {
    pub audio_in: BoundedQueue<AudioFrame>,
    pub text_in: BoundedQueue<OutboundMessage>,
    pub aprs_in: BoundedQueue<OutboundMessage>,
    pub ctrl: BoundedQueue<ControlDirective>,
    pub keys: BoundedQueue<KeyEvent>,
    pub audio_out: BoundedQueue<DecodedVoice>,
    pub text_out: BoundedQueue<InboundMessage>,
    pub aprs_out: BoundedQueue<InboundMessage>,
    pub status_out: BoundedQueue<StatusEvent>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            audio_in: BoundedQueue::new("audio_in", 24, OverflowPolicy::Block),
            text_in: BoundedQueue::new("text_in", 64, OverflowPolicy::DropOldest),
            aprs_in: BoundedQueue::new("aprs_in", 64, OverflowPolicy::DropOldest),
            ctrl: BoundedQueue::new("ctrl", 16, OverflowPolicy::Block),
            keys: BoundedQueue::new("keys", 4, OverflowPolicy::Replace),
            audio_out: BoundedQueue::new("audio_out", 24, OverflowPolicy::DropOldest),
            text_out: BoundedQueue::new("text_out", 64, OverflowPolicy::DropOldest),
            aprs_out: BoundedQueue::new("aprs_out", 64, OverflowPolicy::DropOldest),
            status_out: BoundedQueue::new("status_out", 128, OverflowPolicy::DropOldest),
        }
    }

    /// Close every queue; blocked producers and consumers unblock.
    pub fn close_all(&self) {
        self.audio_in.close();
        self.text_in.close();
        self.aprs_in.close();
        self.ctrl.close();
        self.keys.close();
        self.audio_out.close();
        self.text_out.close();
        self.aprs_out.close();
        self.status_out.close();
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let q = BoundedQueue::new("t", 8, OverflowPolicy::DropOldest);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_drop_oldest_overflow() {
        let q = BoundedQueue::new("t", 2, OverflowPolicy::DropOldest);
        q.push("a").unwrap();
        q.push("b").unwrap();
        q.push("c").unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_pop(), Some("b"));
        assert_eq!(q.try_pop(), Some("c"));
    }

    #[test]
    fn test_replace_overflow() {
        let q = BoundedQueue::new("keys", 4, OverflowPolicy::Replace);
        q.push(10).unwrap();
        q.push(11).unwrap();
        assert_eq!(q.len(), 1, "replace keeps only the latest");
        assert_eq!(q.try_pop(), Some(11));
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn test_block_policy_waits_for_consumer() {
        let q = Arc::new(BoundedQueue::new("audio", 2, OverflowPolicy::Block));
        q.push(0u8).unwrap();
        q.push(1u8).unwrap();

        let producer = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.push(2u8))
        };
        // Give the producer a moment to block, then free a slot.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.try_pop(), Some(0));
        producer.join().unwrap().unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.dropped(), 0);
    }

    #[test]
    fn test_close_unblocks_and_drains() {
        let q = Arc::new(BoundedQueue::new("t", 4, OverflowPolicy::Block));
        q.push(7).unwrap();
        q.close();
        assert!(matches!(
            q.push(8),
            Err(SleipnirError::QueueClosed("t"))
        ));
        // Remaining items drain, then None.
        assert_eq!(q.pop(), Some(7));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let q: BoundedQueue<u8> = BoundedQueue::new("t", 4, OverflowPolicy::Block);
        let start = std::time::Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_cross_thread_handoff() {
        let q = Arc::new(BoundedQueue::new("t", 24, OverflowPolicy::Block));
        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut got = Vec::new();
                while let Some(v) = q.pop() {
                    got.push(v);
                }
                got
            })
        };
        for i in 0..100u32 {
            q.push(i).unwrap();
        }
        q.close();
        let got = consumer.join().unwrap();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_bus_bounds_match_contract() {
        let bus = MessageBus::new();
        assert_eq!(bus.audio_in.capacity(), 24);
        assert_eq!(bus.text_in.capacity(), 64);
        assert_eq!(bus.ctrl.capacity(), 16);
        assert_eq!(bus.keys.capacity(), 4);
        assert_eq!(bus.status_out.capacity(), 128);
    }

    #[test]
    fn test_key_event_to_directive() {
        let ev = KeyEvent::MacKey(vec![1; 32]);
        assert_eq!(
            ev.into_directive(),
            ControlDirective::MacKey { key: vec![1; 32] }
        );
    }
}
