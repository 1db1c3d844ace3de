//! # Sleipnir Core Waveform Engine
//!
//! This crate implements the core of Sleipnir, a narrowband digital-voice
//! waveform for amateur VHF/UHF: audio in, modulated-ready codewords out,
//! and the reverse.
//!
//! ## Overview
//!
//! On air, Sleipnir groups 25 consecutive 40 ms frames into one-second
//! *superframes*. Position 0 carries either an ECDSA authentication frame,
//! a receiver-acquisition sync frame, or ordinary user data; positions 1-24
//! carry voice, text, or APRS payloads. Every frame is independently
//! LDPC-encoded at one of two code rates and optionally protected with
//! ChaCha20-Poly1305.
//!
//! ## Signal Flow
//!
//! ```text
//! TX: Opus frames ──► SuperframeAssembler ──► FrameRouter ──► LdpcCodec ──► bits
//!        text/APRS ──┘      (25-frame tick)       (matrix + crypto chain)
//!
//! RX: bits ──► LdpcCodec ──► SuperframeParser ──► voice / text / APRS / status
//!                 (frame-aware)    (sync state machine, MAC + signature checks)
//! ```
//!
//! The audio codec (Opus, fixed 40-byte frames), the FSK modem, PTT hardware
//! and key storage are external collaborators reached through the trait seams
//! in [`pipeline`] and the typed queues in [`bus`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use sleipnir_core::assembler::SuperframeAssembler;
//! use sleipnir_core::ldpc::LdpcCodec;
//! use sleipnir_core::session::SessionConfig;
//!
//! let auth = LdpcCodec::from_alist_file("ldpc_matrices/ldpc_auth_768_256.alist").unwrap();
//! let voice = LdpcCodec::from_alist_file("ldpc_matrices/ldpc_voice_576_384.alist").unwrap();
//!
//! let config = SessionConfig { local_callsign: "N0CALL".into(), ..Default::default() };
//! let mut tx = SuperframeAssembler::new(config.build().unwrap(), auth.into(), voice.into());
//!
//! tx.ptt_pressed();
//! tx.push_voice([0u8; 40]); // one Opus frame; silence fills the rest
//! let superframe = tx.tick().unwrap().unwrap();
//! assert_eq!(superframe.frames.len(), 25);
//! ```

pub mod alist;
pub mod assembler;
pub mod bus;
pub mod crypto;
pub mod frame;
pub mod ldpc;
pub mod observe;
pub mod parser;
pub mod pipeline;
pub mod router;
pub mod session;
pub mod types;

pub use types::{Result, SleipnirError};
