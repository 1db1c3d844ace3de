//! Cryptographic services for the superframe engine.
//!
//! Two logically independent services live here:
//!
//! - **ECDSA over BrainpoolP256r1** for the position-0 authentication frame.
//!   Signing is deterministic (RFC 6979), so identical inputs always produce
//!   identical signatures. On the wire the signature is truncated to its
//!   first 32 bytes (the big-endian `r` component); see [`AuthPublicKey`]
//!   for what that implies for verification.
//! - **ChaCha20-Poly1305** authenticated encryption for user frames, with
//!   the 16-byte Poly1305 tag truncated to 8 bytes on the wire and
//!   reconstructed by recomputation on the receive side.
//!
//! Nonces are caller-derived from the superframe counter and frame position;
//! the provider keeps a per-session registry and treats any repeat of a
//! `(key, nonce)` pair as fatal [`SleipnirError::NonceReuse`].

use std::collections::HashSet;
use std::sync::Mutex;

use bp256::r1::ecdsa::Signature;
use bp256::r1::BrainpoolP256r1;

type SigningKey = ecdsa::SigningKey<BrainpoolP256r1>;
type VerifyingKey = ecdsa::VerifyingKey<BrainpoolP256r1>;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ecdsa::elliptic_curve::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ecdsa::signature::hazmat::{PrehashSigner, PrehashVerifier};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::types::{Result, SleipnirError, WIRE_MAC_BYTES};

/// Symmetric key size (ChaCha20-Poly1305).
pub const MAC_KEY_BYTES: usize = 32;

/// Nonce size (ChaCha20-Poly1305, 96-bit).
pub const NONCE_BYTES: usize = 12;

/// Truncated on-wire signature size.
pub const SIGNATURE_BYTES: usize = 32;

/// Full Poly1305 tag size before truncation.
pub const FULL_TAG_BYTES: usize = 16;

// ---------------------------------------------------------------------------
// Nonce derivation
// ---------------------------------------------------------------------------

/// Derive the per-frame AEAD nonce.
///
/// Wire rule: the first 8 bytes are
/// `nonce_base[0..8] XOR (counter_be32 || position || 0x00 0x00 0x00)`,
/// the last 4 bytes are `nonce_base[8..12]` unchanged. Distinct
/// `(counter, position)` pairs therefore give distinct nonces for the whole
/// counter period.
pub fn derive_nonce(base: &[u8; NONCE_BYTES], counter: u32, position: u8) -> [u8; NONCE_BYTES] {
    let mut nonce = *base;
    let mut mix = [0u8; 8];
    mix[..4].copy_from_slice(&counter.to_be_bytes());
    mix[4] = position;
    for (n, m) in nonce[..8].iter_mut().zip(mix) {
        *n ^= m;
    }
    nonce
}

/// SHA-256 digest over the as-transmitted superframe payloads, the value the
/// auth frame signs.
pub fn superframe_digest<'a, I>(payloads: I) -> [u8; 32]
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for p in payloads {
        hasher.update(p);
    }
    hasher.finalize().into()
}

// ---------------------------------------------------------------------------
// MAC failure marker
// ---------------------------------------------------------------------------

/// Authentication failure on `open`/MAC verification.
///
/// A frame-level condition: the parser turns it into a status event and
/// keeps going, it never aborts the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacInvalid;

// ---------------------------------------------------------------------------
// AEAD provider
// ---------------------------------------------------------------------------

/// ChaCha20-Poly1305 provider with nonce-reuse detection.
///
/// The nonce registry is the only mutable shared state in the crypto layer;
/// it serializes on a single mutex doing O(1) work per frame. Sealing
/// registers the `(key, nonce)` pair; opening never does (the receive side
/// legitimately revisits nonces the transmitter already used).
#[derive(Debug, Default)]
pub struct CryptoProvider {
    seen_nonces: Mutex<HashSet<([u8; MAC_KEY_BYTES], [u8; NONCE_BYTES])>>,
}

impl CryptoProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all registered nonces. Called when the session key is
    /// replaced; a fresh key starts a fresh `(key, nonce)` space.
    pub fn reset_nonces(&self) {
        self.seen_nonces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    fn register_nonce(&self, key: &[u8; MAC_KEY_BYTES], nonce: &[u8; NONCE_BYTES]) -> Result<()> {
        let mut seen = self
            .seen_nonces
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !seen.insert((*key, *nonce)) {
            return Err(SleipnirError::NonceReuse);
        }
        Ok(())
    }

    /// Encrypt and authenticate: returns `ciphertext || tag16`.
    ///
    /// Fatal [`SleipnirError::NonceReuse`] if this `(key, nonce)` pair was
    /// already sealed within the session.
    pub fn seal(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        self.register_nonce(key, nonce)?;
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SleipnirError::KeyFormatInvalid("AEAD seal failed".into()))
    }

    /// Decrypt and verify `ciphertext || tag16`.
    pub fn open(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        ciphertext_and_tag: &[u8],
    ) -> std::result::Result<Vec<u8>, MacInvalid> {
        if ciphertext_and_tag.len() < FULL_TAG_BYTES {
            return Err(MacInvalid);
        }
        let cipher = ChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext_and_tag,
                    aad,
                },
            )
            .map_err(|_| MacInvalid)
    }

    /// Compute the 8-byte truncated tag over `aad` alone (empty plaintext).
    /// This is the MAC-only path for unencrypted frames; the tag binds the
    /// frame bytes through the AAD. Registers the nonce.
    pub fn mac_truncated(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
    ) -> Result<[u8; WIRE_MAC_BYTES]> {
        self.register_nonce(key, nonce)?;
        let tag16 = self.compute_tag(key, nonce, aad, &[])?;
        let mut tag8 = [0u8; WIRE_MAC_BYTES];
        tag8.copy_from_slice(&tag16[..WIRE_MAC_BYTES]);
        Ok(tag8)
    }

    /// Verify an 8-byte truncated MAC-only tag by recomputation.
    pub fn verify_mac_truncated(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        tag8: &[u8; WIRE_MAC_BYTES],
    ) -> bool {
        match self.compute_tag(key, nonce, aad, &[]) {
            Ok(tag16) => tag16[..WIRE_MAC_BYTES].ct_eq(tag8).into(),
            Err(_) => false,
        }
    }

    /// Encrypt and return `(ciphertext, tag8)` for the wire. Registers the
    /// nonce.
    pub fn seal_truncated(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; WIRE_MAC_BYTES])> {
        let mut sealed = self.seal(key, nonce, aad, plaintext)?;
        let tag16 = sealed.split_off(sealed.len() - FULL_TAG_BYTES);
        let mut tag8 = [0u8; WIRE_MAC_BYTES];
        tag8.copy_from_slice(&tag16[..WIRE_MAC_BYTES]);
        Ok((sealed, tag8))
    }

    /// Open a ciphertext whose tag was truncated to 8 bytes on the wire.
    ///
    /// The provider reconstructs the full 16-byte tag by recomputing:
    /// the candidate plaintext is recovered with the ChaCha20 keystream
    /// (payload blocks start at block 1 per RFC 8439), re-sealed, and the
    /// recomputed tag prefix compared against the wire tag in constant
    /// time.
    pub fn open_truncated(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        ciphertext: &[u8],
        tag8: &[u8; WIRE_MAC_BYTES],
    ) -> std::result::Result<Vec<u8>, MacInvalid> {
        let mut candidate = ciphertext.to_vec();
        let mut keystream = ChaCha20::new(key.into(), nonce.into());
        keystream.seek(64u64);
        keystream.apply_keystream(&mut candidate);

        let tag16 = self
            .compute_tag(key, nonce, aad, &candidate)
            .map_err(|_| MacInvalid)?;
        if bool::from(tag16[..WIRE_MAC_BYTES].ct_eq(tag8)) {
            Ok(candidate)
        } else {
            Err(MacInvalid)
        }
    }

    /// Recompute the full 16-byte tag for a plaintext without touching the
    /// nonce registry.
    fn compute_tag(
        &self,
        key: &[u8; MAC_KEY_BYTES],
        nonce: &[u8; NONCE_BYTES],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<[u8; FULL_TAG_BYTES]> {
        let cipher = ChaCha20Poly1305::new(key.into());
        let sealed = cipher
            .encrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SleipnirError::KeyFormatInvalid("AEAD tag computation failed".into()))?;
        let mut tag = [0u8; FULL_TAG_BYTES];
        tag.copy_from_slice(&sealed[sealed.len() - FULL_TAG_BYTES..]);
        Ok(tag)
    }
}

// ---------------------------------------------------------------------------
// ECDSA keys
// ---------------------------------------------------------------------------

fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.starts_with(b"-----BEGIN")
}

/// A BrainpoolP256r1 signing key (TX side).
#[derive(Clone)]
pub struct AuthKeyPair {
    signing: SigningKey,
}

impl std::fmt::Debug for AuthKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("AuthKeyPair(..)")
    }
}

impl AuthKeyPair {
    /// Load from PKCS#8 PEM, PKCS#8 DER, or a raw 32-byte scalar.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let signing = if looks_like_pem(bytes) {
            let pem = std::str::from_utf8(bytes)
                .map_err(|_| SleipnirError::KeyFormatInvalid("PEM is not UTF-8".into()))?;
            SigningKey::from_pkcs8_pem(pem)
                .map_err(|e| SleipnirError::KeyFormatInvalid(format!("PEM private key: {e}")))?
        } else if bytes.len() == 32 {
            SigningKey::from_slice(bytes)
                .map_err(|e| SleipnirError::KeyFormatInvalid(format!("raw scalar: {e}")))?
        } else {
            SigningKey::from_pkcs8_der(bytes)
                .map_err(|e| SleipnirError::KeyFormatInvalid(format!("DER private key: {e}")))?
        };
        Ok(Self { signing })
    }

    /// The matching verification entry, retaining the scalar so truncated
    /// signatures stay verifiable.
    pub fn public(&self) -> AuthPublicKey {
        AuthPublicKey {
            verifying: *self.signing.verifying_key(),
            signing: Some(self.signing.clone()),
        }
    }

    /// Deterministically sign a 32-byte digest; returns the truncated
    /// 32-byte wire signature (the big-endian `r` component).
    pub fn sign32(&self, digest: &[u8; 32]) -> Result<[u8; SIGNATURE_BYTES]> {
        let signature: Signature = self
            .signing
            .sign_prehash(digest)
            .map_err(|e| SleipnirError::SignatureMalformed(e.to_string()))?;
        let bytes = signature.to_bytes();
        let mut out = [0u8; SIGNATURE_BYTES];
        out.copy_from_slice(&bytes[..SIGNATURE_BYTES]);
        Ok(out)
    }

    /// Full 64-byte signature, for callers that can afford the wire space.
    pub fn sign_full(&self, digest: &[u8; 32]) -> Result<[u8; 64]> {
        let signature: Signature = self
            .signing
            .sign_prehash(digest)
            .map_err(|e| SleipnirError::SignatureMalformed(e.to_string()))?;
        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        Ok(out)
    }
}

/// A verification entry in the RX public-key directory.
///
/// The on-air signature carries only `r`, which a bare public point cannot
/// check. Entries loaded from private-key documents keep the scalar and
/// verify truncated signatures by deterministic re-signing; entries holding
/// only the public point can verify full 64-byte signatures but report
/// truncated ones as unverifiable (`false`), which under
/// `require_signatures` becomes a policy rejection.
#[derive(Clone)]
pub struct AuthPublicKey {
    verifying: VerifyingKey,
    signing: Option<SigningKey>,
}

impl std::fmt::Debug for AuthPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthPublicKey(truncated_capable: {})", self.signing.is_some())
    }
}

impl AuthPublicKey {
    /// Load from SPKI PEM/DER, a SEC1 point, or a private-key document
    /// (PKCS#8 PEM/DER or raw scalar, which retains truncated-signature
    /// verification capability).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if looks_like_pem(bytes) {
            let pem = std::str::from_utf8(bytes)
                .map_err(|_| SleipnirError::KeyFormatInvalid("PEM is not UTF-8".into()))?;
            if let Ok(verifying) = VerifyingKey::from_public_key_pem(pem) {
                return Ok(Self {
                    verifying,
                    signing: None,
                });
            }
            return AuthKeyPair::from_bytes(bytes).map(|pair| pair.public());
        }
        if let Ok(verifying) = VerifyingKey::from_public_key_der(bytes) {
            return Ok(Self {
                verifying,
                signing: None,
            });
        }
        if let Ok(verifying) = VerifyingKey::from_sec1_bytes(bytes) {
            return Ok(Self {
                verifying,
                signing: None,
            });
        }
        AuthKeyPair::from_bytes(bytes).map(|pair| pair.public())
    }

    /// Whether this entry can check the truncated wire signature.
    pub fn can_verify_truncated(&self) -> bool {
        self.signing.is_some()
    }

    /// Verify a truncated 32-byte signature over a digest.
    ///
    /// Tampered digests and malformed signatures return `false`; nothing
    /// here raises.
    pub fn verify32(&self, digest: &[u8; 32], signature: &[u8; SIGNATURE_BYTES]) -> bool {
        match &self.signing {
            Some(signing) => {
                let expected: Signature = match signing.sign_prehash(digest) {
                    Ok(sig) => sig,
                    Err(_) => return false,
                };
                expected.to_bytes()[..SIGNATURE_BYTES].ct_eq(signature).into()
            }
            None => {
                tracing::debug!(
                    "public-only directory entry cannot verify a truncated signature"
                );
                false
            }
        }
    }

    /// Verify a full 64-byte `r || s` signature over a digest.
    pub fn verify_full(&self, digest: &[u8; 32], signature: &[u8; 64]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.verifying.verify_prehash(digest, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
