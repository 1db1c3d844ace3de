//! Session state and the closed control-directive surface.
//!
//! A [`SessionState`] is an explicit value with lifecycle
//! `init -> running -> teardown`: it owns the key material, the recipient
//! list, and the sync parameters for one direction of one link. Nothing in
//! the engine reaches into process-wide registries; the core consumes key
//! material as values and releases everything deterministically on
//! teardown.
//!
//! Runtime reconfiguration happens through [`ControlDirective`], a closed
//! enum: unknown directive names fail serde deserialization instead of
//! being silently accepted.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{AuthKeyPair, AuthPublicKey, CryptoProvider, MAC_KEY_BYTES, NONCE_BYTES};
use crate::frame::{Security, SymmetricKeys};
use crate::router::PolicySnapshot;
use crate::types::{
    Callsign, Result, SleipnirError, DEFAULT_REASSEMBLY_WINDOW, DEFAULT_SYNC_INTERVAL,
};

// ---------------------------------------------------------------------------
// Control directives
// ---------------------------------------------------------------------------

/// Typed control directives accepted over the `ctrl` queue.
///
/// The set is closed by design: a directive name outside this enum is a
/// deserialization error, never a silent no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", rename_all = "snake_case")]
pub enum ControlDirective {
    /// Toggle the position-0 ECDSA auth frame.
    EnableSigning { on: bool },
    /// Toggle per-frame AEAD.
    EnableEncryption { on: bool },
    /// Replace the recipient list (the address field bound into AAD).
    Recipients { callsigns: Vec<String> },
    /// Set the local station identity.
    LocalCallsign { callsign: String },
    /// RX only: reject superframes without a valid signature.
    RequireSignatures { on: bool },
    /// Sync-frame insertion interval, 1..=255 superframes.
    SyncInterval { superframes: u32 },
    /// Install the 32-byte symmetric session key.
    MacKey { key: Vec<u8> },
    /// Install the 12-byte nonce base.
    NonceBase { bytes: Vec<u8> },
    /// Install the local BrainpoolP256r1 private key (PEM, DER, or raw
    /// scalar).
    PrivateKey { key: Vec<u8> },
    /// Install a directory entry for a remote station.
    PublicKey { callsign: String, key: Vec<u8> },
}

// ---------------------------------------------------------------------------
// Session configuration
// ---------------------------------------------------------------------------

/// Serde-visible session configuration. Key material arrives separately
/// (control directives or [`SessionConfig::build`] callers), never through
/// config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Local station callsign (5 ASCII characters).
    pub local_callsign: String,
    /// Sign superframes when a private key is installed.
    pub enable_signing: bool,
    /// Encrypt user frames when symmetric material is installed.
    pub enable_encryption: bool,
    /// RX: drop user payloads of unsigned or badly signed superframes.
    pub require_signatures: bool,
    /// Sync-frame insertion interval in superframes (1..=255).
    pub sync_interval: u32,
    /// Recipient callsigns.
    pub recipients: Vec<String>,
    /// Fragment reassembly window in superframes.
    pub reassembly_window: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            local_callsign: "N0CALL".to_string(),
            enable_signing: false,
            enable_encryption: false,
            require_signatures: false,
            sync_interval: u32::from(DEFAULT_SYNC_INTERVAL),
            recipients: Vec::new(),
            reassembly_window: DEFAULT_REASSEMBLY_WINDOW,
        }
    }
}

impl SessionConfig {
    /// Validate and build the live session state (lifecycle `init`).
    pub fn build(self) -> Result<SessionState> {
        let sync_interval = validate_sync_interval(self.sync_interval)?;
        let local_callsign = Callsign::new(&self.local_callsign)?;
        let recipients = self
            .recipients
            .iter()
            .map(|s| Callsign::new(s))
            .collect::<Result<Vec<_>>>()?;
        if self.reassembly_window == 0 {
            return Err(SleipnirError::InvalidConfig(
                "reassembly_window must be at least 1 superframe".into(),
            ));
        }
        Ok(SessionState {
            lifecycle: Lifecycle::Init,
            local_callsign,
            enable_signing: self.enable_signing,
            enable_encryption: self.enable_encryption,
            require_signatures: self.require_signatures,
            sync_interval,
            recipients,
            reassembly_window: self.reassembly_window,
            signing_key: None,
            public_keys: HashMap::new(),
            mac_key: None,
            nonce_base: None,
        })
    }
}

fn validate_sync_interval(value: u32) -> Result<u8> {
    if (1..=255).contains(&value) {
        Ok(value as u8)
    } else {
        Err(SleipnirError::InvalidConfig(format!(
            "sync_interval must be 1..=255, got {value}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Init,
    Running,
    Teardown,
}

/// Per-direction session state: identity, policy, and key material.
#[derive(Debug)]
pub struct SessionState {
    pub lifecycle: Lifecycle,
    pub local_callsign: Callsign,
    pub enable_signing: bool,
    pub enable_encryption: bool,
    pub require_signatures: bool,
    pub sync_interval: u8,
    pub recipients: Vec<Callsign>,
    pub reassembly_window: u32,
    pub signing_key: Option<AuthKeyPair>,
    pub public_keys: HashMap<Callsign, AuthPublicKey>,
    pub mac_key: Option<[u8; MAC_KEY_BYTES]>,
    pub nonce_base: Option<[u8; NONCE_BYTES]>,
}

impl SessionState {
    /// Enter `running`.
    pub fn begin(&mut self) -> Result<()> {
        if self.lifecycle != Lifecycle::Init {
            return Err(SleipnirError::SessionLifecycle("begin requires init"));
        }
        self.lifecycle = Lifecycle::Running;
        Ok(())
    }

    /// Enter `teardown` and release key material deterministically.
    pub fn teardown(&mut self) {
        self.lifecycle = Lifecycle::Teardown;
        self.signing_key = None;
        self.public_keys.clear();
        self.mac_key = None;
        self.nonce_base = None;
    }

    /// Routing policy as of now. Signing and encryption are only "on" when
    /// both the switch and the matching key material are present.
    pub fn policy(&self) -> PolicySnapshot {
        PolicySnapshot {
            signing_on: self.enable_signing && self.signing_key.is_some(),
            encryption_on: self.enable_encryption && self.symmetric_ready(),
        }
    }

    fn symmetric_ready(&self) -> bool {
        self.mac_key.is_some() && self.nonce_base.is_some()
    }

    /// Frame security mode for the configured material: AEAD when
    /// encryption is on, MAC-only when just the key is installed, plaintext
    /// otherwise.
    pub fn security<'a>(&'a self, provider: &'a CryptoProvider) -> Security<'a> {
        match (&self.mac_key, &self.nonce_base) {
            (Some(key), Some(nonce_base)) => {
                let keys = SymmetricKeys {
                    provider,
                    key,
                    nonce_base,
                };
                if self.enable_encryption {
                    Security::Encrypted(keys)
                } else {
                    Security::Mac(keys)
                }
            }
            _ => Security::Plaintext,
        }
    }

    /// The callsign bound into AAD on the receive side: the expected peer
    /// (first recipient entry) or, for loopback/broadcast setups, the local
    /// callsign.
    pub fn sender_identity(&self) -> Callsign {
        self.recipients.first().copied().unwrap_or(self.local_callsign)
    }

    /// Directory entry for a sender, if installed.
    pub fn directory_entry(&self, callsign: Callsign) -> Option<&AuthPublicKey> {
        self.public_keys.get(&callsign)
    }

    /// Apply one control directive.
    ///
    /// Installing a new symmetric key resets the provider's nonce registry:
    /// a fresh key opens a fresh `(key, nonce)` space.
    pub fn apply(&mut self, directive: ControlDirective, provider: &CryptoProvider) -> Result<()> {
        match directive {
            ControlDirective::EnableSigning { on } => self.enable_signing = on,
            ControlDirective::EnableEncryption { on } => self.enable_encryption = on,
            ControlDirective::Recipients { callsigns } => {
                self.recipients = callsigns
                    .iter()
                    .map(|s| Callsign::new(s))
                    .collect::<Result<Vec<_>>>()?;
            }
            ControlDirective::LocalCallsign { callsign } => {
                self.local_callsign = Callsign::new(&callsign)?;
            }
            ControlDirective::RequireSignatures { on } => self.require_signatures = on,
            ControlDirective::SyncInterval { superframes } => {
                self.sync_interval = validate_sync_interval(superframes)?;
            }
            ControlDirective::MacKey { key } => {
                let key: [u8; MAC_KEY_BYTES] = key.as_slice().try_into().map_err(|_| {
                    SleipnirError::KeyFormatInvalid(format!(
                        "mac_key must be {MAC_KEY_BYTES} bytes, got {}",
                        key.len()
                    ))
                })?;
                self.mac_key = Some(key);
                provider.reset_nonces();
            }
            ControlDirective::NonceBase { bytes } => {
                let base: [u8; NONCE_BYTES] = bytes.as_slice().try_into().map_err(|_| {
                    SleipnirError::KeyFormatInvalid(format!(
                        "nonce_base must be {NONCE_BYTES} bytes, got {}",
                        bytes.len()
                    ))
                })?;
                self.nonce_base = Some(base);
            }
            ControlDirective::PrivateKey { key } => {
                self.signing_key = Some(AuthKeyPair::from_bytes(&key)?);
            }
            ControlDirective::PublicKey { callsign, key } => {
                let callsign = Callsign::new(&callsign)?;
                let entry = AuthPublicKey::from_bytes(&key)?;
                self.public_keys.insert(callsign, entry);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
