//! Frame-aware LDPC encoding and hard-decision decoding.
//!
//! Sleipnir protects every frame with one of two codes:
//!
//! - **Auth matrix** (512 x 768, rate 1/3): the 32-byte authentication
//!   payload, transmitted at the most robust rate.
//! - **Voice matrix** (192 x 576, rate 2/3): all 48-byte user payloads.
//!
//! Encoding is systematic: information bits occupy the low codeword indices
//! and parity bits are solved from `H · c = 0` by back-substitution over the
//! upper-triangular parity block the shipped matrices carry. Decoding is
//! iterative bit flipping on hard decisions from the demodulator.
//!
//! # Example
//!
//! ```rust,no_run
//! use sleipnir_core::ldpc::LdpcCodec;
//!
//! let codec = LdpcCodec::from_alist_file("ldpc_matrices/ldpc_voice_576_384.alist").unwrap();
//!
//! let info: Vec<u8> = (0..codec.info_bits()).map(|i| (i % 3 == 0) as u8).collect();
//! let mut codeword = codec.encode(&info).unwrap();
//! assert!(codec.matrix().is_codeword(&codeword));
//!
//! codeword[17] ^= 1; // single channel flip
//! let result = codec.decode_hard(&codeword, LdpcCodec::DEFAULT_MAX_ITERS);
//! assert!(result.converged);
//! assert_eq!(result.info_bits, info);
//! ```

use std::path::Path;

use crate::alist::ParityCheckMatrix;
use crate::types::{Result, SleipnirError};

// ---------------------------------------------------------------------------
// Decode result
// ---------------------------------------------------------------------------

/// Output of a hard-decision decode attempt.
///
/// Decoding never fails outright: a diverged decode still carries
/// best-effort information bits, with `converged == false` and the residual
/// syndrome weight for the status event.
#[derive(Debug, Clone)]
pub struct HardDecodeResult {
    /// Systematic (information) bits of the decoder output.
    pub info_bits: Vec<u8>,
    /// Full corrected codeword.
    pub codeword: Vec<u8>,
    /// Unsatisfied parity checks remaining after the final iteration.
    pub syndrome_residual: usize,
    /// Whether the decoder reached a zero syndrome.
    pub converged: bool,
    /// Flip iterations performed.
    pub iterations: usize,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Systematic LDPC encoder / hard-decision decoder for one parity-check
/// matrix.
///
/// The matrix is immutable after construction and the codec carries no
/// per-frame state, so one instance may be shared by reference across
/// concurrent encode/decode invocations.
#[derive(Debug, Clone)]
pub struct LdpcCodec {
    h: ParityCheckMatrix,
    /// For each check row `i`, the parity indices `j > i` participating in
    /// that row. Together with the mandatory diagonal this is the whole
    /// parity block, so `p[i] = acc[i] ^ XOR p[j]` solves row `i`.
    row_parity_above: Vec<Vec<usize>>,
}

impl LdpcCodec {
    /// Default flip-iteration bound for on-air decoding.
    pub const DEFAULT_MAX_ITERS: usize = 20;

    /// Build a codec, validating that the matrix supports systematic
    /// back-substitution encoding.
    pub fn new(h: ParityCheckMatrix) -> Result<Self> {
        let m = h.num_checks();
        let k = h.num_info_bits();

        // The parity block (columns k..n) must be upper triangular with a
        // full diagonal in the AList ordering, or parity bits cannot be
        // solved by back-substitution.
        for j in 0..m {
            let rows = h.var_neighbors(k + j);
            if !rows.contains(&j) {
                return Err(SleipnirError::AListMalformed(format!(
                    "parity column {j} is missing its diagonal entry"
                )));
            }
            if rows.iter().any(|&r| r > j) {
                return Err(SleipnirError::AListMalformed(format!(
                    "parity column {j} reaches below the diagonal; \
                     matrix does not support back-substitution encoding"
                )));
            }
        }

        let mut row_parity_above = vec![Vec::new(); m];
        for (i, row) in row_parity_above.iter_mut().enumerate() {
            for &col in h.check_neighbors(i) {
                if col >= k && col - k != i {
                    row.push(col - k);
                }
            }
        }

        Ok(Self {
            h,
            row_parity_above,
        })
    }

    /// Build from AList text.
    pub fn from_alist_str(text: &str) -> Result<Self> {
        Self::new(ParityCheckMatrix::from_alist_str(text)?)
    }

    /// Build from an AList file.
    pub fn from_alist_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(ParityCheckMatrix::from_alist_file(path)?)
    }

    /// The underlying parity-check matrix.
    pub fn matrix(&self) -> &ParityCheckMatrix {
        &self.h
    }

    /// Codeword length in bits.
    pub fn codeword_bits(&self) -> usize {
        self.h.num_vars()
    }

    /// Information bits per codeword.
    pub fn info_bits(&self) -> usize {
        self.h.num_info_bits()
    }

    /// Guaranteed-correctable error weight for the shipped matrices.
    ///
    /// The 4-cycle-free column construction makes every single-bit error
    /// recoverable under the flip rule below; two-bit patterns are usually
    /// but not always recovered.
    pub fn correction_budget(&self) -> usize {
        1
    }

    /// Systematically encode `info_bits` (0/1 values) into a codeword.
    ///
    /// Deterministic: identical inputs yield identical codewords. The
    /// result always satisfies `H · c = 0`.
    pub fn encode(&self, info_bits: &[u8]) -> Result<Vec<u8>> {
        let k = self.info_bits();
        let m = self.h.num_checks();
        if info_bits.len() != k {
            return Err(SleipnirError::InfoLengthMismatch {
                got: info_bits.len(),
                expected: k,
            });
        }

        // acc[i] = XOR of information bits participating in check i.
        let mut acc = vec![0u8; m];
        for (col, &bit) in info_bits.iter().enumerate() {
            if bit & 1 != 0 {
                for &row in self.h.var_neighbors(col) {
                    acc[row] ^= 1;
                }
            }
        }

        // Back-substitute parity bits from the last check upward.
        let mut parity = vec![0u8; m];
        for i in (0..m).rev() {
            let mut p = acc[i];
            for &j in &self.row_parity_above[i] {
                p ^= parity[j];
            }
            parity[i] = p;
        }

        let mut codeword = Vec::with_capacity(self.codeword_bits());
        codeword.extend(info_bits.iter().map(|&b| b & 1));
        codeword.extend_from_slice(&parity);
        Ok(codeword)
    }

    /// Encode a byte payload whose bit length matches the matrix.
    pub fn encode_bytes(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.encode(&crate::types::bytes_to_bits(payload))
    }

    /// Iterative bit-flipping decode of `received` hard decisions.
    ///
    /// Each iteration flips every variable whose incident checks fail
    /// strictly more than half the time; ties never flip. Terminates early
    /// on a zero syndrome and honours `max_iters` as a hard bound.
    /// `max_iters == 0` returns the received systematic bits unchanged with
    /// `converged` reflecting the syndrome.
    ///
    /// # Panics
    ///
    /// Panics if `received.len()` differs from the codeword length; the
    /// router guarantees the length before dispatching here.
    pub fn decode_hard(&self, received: &[u8], max_iters: usize) -> HardDecodeResult {
        assert_eq!(
            received.len(),
            self.codeword_bits(),
            "received word length must match codeword length"
        );
        let k = self.info_bits();
        let mut word: Vec<u8> = received.iter().map(|&b| b & 1).collect();
        let mut iterations = 0;

        for _ in 0..max_iters {
            let syndrome = self.h.syndrome(&word);
            if syndrome.iter().all(|&s| s == 0) {
                return HardDecodeResult {
                    info_bits: word[..k].to_vec(),
                    syndrome_residual: 0,
                    converged: true,
                    iterations,
                    codeword: word,
                };
            }

            let mut flips = Vec::new();
            for v in 0..word.len() {
                let checks = self.h.var_neighbors(v);
                let failing = checks.iter().filter(|&&c| syndrome[c] != 0).count();
                if 2 * failing > checks.len() {
                    flips.push(v);
                }
            }
            if flips.is_empty() {
                // Stuck: no variable clears the flip threshold.
                break;
            }
            for v in flips {
                word[v] ^= 1;
            }
            iterations += 1;
        }

        let residual = self.h.syndrome_weight(&word);
        HardDecodeResult {
            info_bits: word[..k].to_vec(),
            syndrome_residual: residual,
            converged: residual == 0,
            iterations,
            codeword: word,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;
    use crate::types::{bits_to_bytes, bytes_to_bits};

    fn toy_codec() -> LdpcCodec {
        LdpcCodec::from_alist_str(crate::alist::TEST_ALIST_7_4).unwrap()
    }

    fn voice_codec() -> LdpcCodec {
        LdpcCodec::from_alist_str(include_str!("../ldpc_matrices/ldpc_voice_576_384.alist"))
            .unwrap()
    }

    fn auth_codec() -> LdpcCodec {
        LdpcCodec::from_alist_str(include_str!("../ldpc_matrices/ldpc_auth_768_256.alist"))
            .unwrap()
    }

    /// Deterministic pseudo-random message for a given seed.
    fn message(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(0..2u8)).collect()
    }

    #[test]
    fn test_toy_encode_satisfies_parity() {
        let codec = toy_codec();
        for bits in 0u8..16 {
            let msg: Vec<u8> = (0..4).map(|i| (bits >> i) & 1).collect();
            let cw = codec.encode(&msg).unwrap();
            assert!(codec.matrix().is_codeword(&cw), "msg {msg:?}");
            assert_eq!(&cw[..4], &msg[..]);
        }
    }

    #[test]
    fn test_all_zero_encodes_to_all_zero() {
        for codec in [voice_codec(), auth_codec()] {
            let cw = codec.encode(&vec![0u8; codec.info_bits()]).unwrap();
            assert!(cw.iter().all(|&b| b == 0));
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        let codec = voice_codec();
        let msg = message(codec.info_bits(), 99);
        assert_eq!(codec.encode(&msg).unwrap(), codec.encode(&msg).unwrap());
    }

    #[test]
    fn test_voice_encode_satisfies_parity() {
        let codec = voice_codec();
        for seed in 0..8 {
            let msg = message(codec.info_bits(), seed);
            let cw = codec.encode(&msg).unwrap();
            assert_eq!(cw.len(), 576);
            assert!(codec.matrix().is_codeword(&cw), "seed {seed}");
        }
    }

    #[test]
    fn test_auth_encode_satisfies_parity() {
        let codec = auth_codec();
        for seed in 0..8 {
            let msg = message(codec.info_bits(), seed);
            let cw = codec.encode(&msg).unwrap();
            assert_eq!(cw.len(), 768);
            assert!(codec.matrix().is_codeword(&cw), "seed {seed}");
        }
    }

    #[test]
    fn test_encode_rejects_wrong_length() {
        let codec = voice_codec();
        assert!(matches!(
            codec.encode(&[0u8; 100]),
            Err(SleipnirError::InfoLengthMismatch { got: 100, .. })
        ));
    }

    #[test]
    fn test_encode_bytes_round_trip() {
        let codec = voice_codec();
        let payload: Vec<u8> = (0u8..48).collect();
        let cw = codec.encode_bytes(&payload).unwrap();
        let result = codec.decode_hard(&cw, LdpcCodec::DEFAULT_MAX_ITERS);
        assert!(result.converged);
        assert_eq!(bits_to_bytes(&result.info_bits), payload);
    }

    #[test]
    fn test_clean_decode_converges_immediately() {
        let codec = voice_codec();
        let msg = message(codec.info_bits(), 3);
        let cw = codec.encode(&msg).unwrap();
        let result = codec.decode_hard(&cw, LdpcCodec::DEFAULT_MAX_ITERS);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.syndrome_residual, 0);
        assert_eq!(result.info_bits, msg);
    }

    #[test]
    fn test_voice_single_flip_recovers_everywhere() {
        let codec = voice_codec();
        let msg = message(codec.info_bits(), 7);
        let cw = codec.encode(&msg).unwrap();
        for pos in 0..codec.codeword_bits() {
            let mut noisy = cw.clone();
            noisy[pos] ^= 1;
            let result = codec.decode_hard(&noisy, LdpcCodec::DEFAULT_MAX_ITERS);
            assert!(result.converged, "flip at {pos} did not converge");
            assert_eq!(result.info_bits, msg, "flip at {pos} miscorrected");
        }
    }

    #[test]
    fn test_auth_single_flip_recovers_everywhere() {
        let codec = auth_codec();
        let msg = message(codec.info_bits(), 11);
        let cw = codec.encode(&msg).unwrap();
        for pos in 0..codec.codeword_bits() {
            let mut noisy = cw.clone();
            noisy[pos] ^= 1;
            let result = codec.decode_hard(&noisy, LdpcCodec::DEFAULT_MAX_ITERS);
            assert!(result.converged, "flip at {pos} did not converge");
            assert_eq!(result.info_bits, msg, "flip at {pos} miscorrected");
        }
    }

    #[test]
    fn test_zero_max_iters_passes_through() {
        let codec = voice_codec();
        let msg = message(codec.info_bits(), 21);
        let cw = codec.encode(&msg).unwrap();

        let clean = codec.decode_hard(&cw, 0);
        assert!(clean.converged);
        assert_eq!(clean.info_bits, msg);
        assert_eq!(clean.iterations, 0);

        let mut noisy = cw.clone();
        noisy[5] ^= 1;
        let dirty = codec.decode_hard(&noisy, 0);
        assert!(!dirty.converged);
        assert_eq!(dirty.info_bits, noisy[..codec.info_bits()].to_vec());
        assert!(dirty.syndrome_residual > 0);
    }

    #[test]
    fn test_heavy_corruption_reports_best_effort() {
        let codec = voice_codec();
        let msg = message(codec.info_bits(), 5);
        let cw = codec.encode(&msg).unwrap();
        let mut noisy = cw.clone();
        // Flip a dense stretch well past the correction budget.
        for bit in noisy.iter_mut().take(200) {
            *bit ^= 1;
        }
        let result = codec.decode_hard(&noisy, LdpcCodec::DEFAULT_MAX_ITERS);
        assert_eq!(result.info_bits.len(), codec.info_bits());
        assert_eq!(result.codeword.len(), codec.codeword_bits());
        // Convergence flag must agree with the reported residual.
        assert_eq!(result.converged, result.syndrome_residual == 0);
        assert_eq!(
            result.converged,
            codec.matrix().is_codeword(&result.codeword)
        );
    }

    #[test]
    fn test_rejects_matrix_without_triangular_parity() {
        // Parity column 0 reaches row 1: back-substitution impossible.
        let alist = "\
2 4
2 3
1 1 2 1
2 3
1 0
2 0
1 2
2 0
1 3 0
2 3 4
";
        // Column 2 (first parity column) touches rows 1 and 2.
        let err = LdpcCodec::from_alist_str(alist).unwrap_err();
        assert!(matches!(err, SleipnirError::AListMalformed(_)));
    }

    #[test]
    fn test_bit_helpers_match_payload_sizes() {
        let payload = [0xA5u8; 48];
        assert_eq!(bytes_to_bits(&payload).len(), 384);
        let auth = [0x5Au8; 32];
        assert_eq!(bytes_to_bits(&auth).len(), 256);
    }
}
