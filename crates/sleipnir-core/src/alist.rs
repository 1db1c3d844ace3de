//! AList parity-check matrix loading.
//!
//! Sleipnir's LDPC matrices ship as AList text files, the sparse matrix
//! interchange format used by most FEC toolchains:
//!
//! ```text
//! line 1: nrows ncols
//! line 2: max_col_degree max_row_degree
//! line 3: column-degree list (ncols integers)
//! line 4: row-degree list (nrows integers)
//! next ncols lines: 1-indexed row positions per column, zero-padded
//! next nrows lines: 1-indexed column positions per row, zero-padded
//! ```
//!
//! Zero entries are padding and are skipped. The loader is tolerant of any
//! matrix dimensions (the legacy rate-3/4 and rate-2/3 modem matrices load
//! fine) but rejects structural inconsistencies as
//! [`SleipnirError::AListMalformed`], which is session-fatal.

use std::path::Path;

use crate::types::{Result, SleipnirError};

/// Sparse representation of a binary parity-check matrix **H** (m x n).
///
/// Stored as adjacency lists for both rows (check nodes) and columns
/// (variable nodes) so the decoder can walk the graph in either direction.
/// Immutable after load; shared by reference between encoder and decoder
/// invocations.
#[derive(Debug, Clone)]
pub struct ParityCheckMatrix {
    /// Number of check equations (rows).
    num_checks: usize,
    /// Number of codeword bits (columns).
    num_vars: usize,
    /// For each check node, the sorted variable-node indices with a 1.
    check_to_var: Vec<Vec<usize>>,
    /// For each variable node, the sorted check-node indices with a 1.
    var_to_check: Vec<Vec<usize>>,
}

impl ParityCheckMatrix {
    /// Parse a matrix from AList text.
    pub fn from_alist_str(text: &str) -> Result<Self> {
        let malformed = |msg: &str| SleipnirError::AListMalformed(msg.to_string());

        let mut lines = text.lines().filter(|l| !l.trim().is_empty());

        let header: Vec<usize> = parse_ints(lines.next().ok_or_else(|| malformed("empty file"))?)?;
        let &[m, n] = header.as_slice() else {
            return Err(malformed("header must be `nrows ncols`"));
        };
        if m == 0 || n == 0 || m >= n {
            return Err(SleipnirError::AListMalformed(format!(
                "degenerate dimensions {m}x{n}"
            )));
        }

        let degrees: Vec<usize> = parse_ints(lines.next().ok_or_else(|| malformed("missing degree line"))?)?;
        let &[max_col_degree, max_row_degree] = degrees.as_slice() else {
            return Err(malformed("line 2 must be `max_col_degree max_row_degree`"));
        };

        let col_degrees = parse_ints(lines.next().ok_or_else(|| malformed("missing column degrees"))?)?;
        if col_degrees.len() != n {
            return Err(malformed("column degree list length != ncols"));
        }
        let row_degrees = parse_ints(lines.next().ok_or_else(|| malformed("missing row degrees"))?)?;
        if row_degrees.len() != m {
            return Err(malformed("row degree list length != nrows"));
        }

        let mut var_to_check: Vec<Vec<usize>> = Vec::with_capacity(n);
        for col in 0..n {
            let line = lines
                .next()
                .ok_or_else(|| malformed("truncated column adjacency"))?;
            let entries: Vec<usize> = parse_ints(line)?;
            // Zero entries are padding.
            let mut rows: Vec<usize> = entries
                .into_iter()
                .filter(|&e| e != 0)
                .map(|e| e - 1)
                .collect();
            rows.sort_unstable();
            rows.dedup();
            if rows.len() != col_degrees[col] {
                return Err(SleipnirError::AListMalformed(format!(
                    "column {col}: {} entries but declared degree {}",
                    rows.len(),
                    col_degrees[col]
                )));
            }
            if rows.len() > max_col_degree {
                return Err(SleipnirError::AListMalformed(format!(
                    "column {col} exceeds max column degree {max_col_degree}"
                )));
            }
            if rows.iter().any(|&r| r >= m) {
                return Err(SleipnirError::AListMalformed(format!(
                    "column {col}: row index out of range"
                )));
            }
            var_to_check.push(rows);
        }

        let mut check_to_var: Vec<Vec<usize>> = Vec::with_capacity(m);
        for row in 0..m {
            let line = lines
                .next()
                .ok_or_else(|| malformed("truncated row adjacency"))?;
            let entries: Vec<usize> = parse_ints(line)?;
            let mut cols: Vec<usize> = entries
                .into_iter()
                .filter(|&e| e != 0)
                .map(|e| e - 1)
                .collect();
            cols.sort_unstable();
            cols.dedup();
            if cols.len() != row_degrees[row] {
                return Err(SleipnirError::AListMalformed(format!(
                    "row {row}: {} entries but declared degree {}",
                    cols.len(),
                    row_degrees[row]
                )));
            }
            if cols.len() > max_row_degree {
                return Err(SleipnirError::AListMalformed(format!(
                    "row {row} exceeds max row degree {max_row_degree}"
                )));
            }
            if cols.iter().any(|&c| c >= n) {
                return Err(SleipnirError::AListMalformed(format!(
                    "row {row}: column index out of range"
                )));
            }
            check_to_var.push(cols);
        }

        let matrix = Self {
            num_checks: m,
            num_vars: n,
            check_to_var,
            var_to_check,
        };

        // Both adjacency views must describe the same matrix.
        for c in 0..m {
            for &v in matrix.check_neighbors(c) {
                if !matrix.var_neighbors(v).contains(&c) {
                    return Err(SleipnirError::AListMalformed(format!(
                        "row {c} lists column {v} but not vice versa"
                    )));
                }
            }
        }
        let edges_by_rows: usize = matrix.check_to_var.iter().map(Vec::len).sum();
        let edges_by_cols: usize = matrix.var_to_check.iter().map(Vec::len).sum();
        if edges_by_rows != edges_by_cols {
            return Err(malformed("row and column adjacency disagree on edge count"));
        }

        Ok(matrix)
    }

    /// Load a matrix from an AList file on disk.
    pub fn from_alist_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| SleipnirError::MatrixIo {
            path: path.display().to_string(),
            source_msg: e.to_string(),
        })?;
        Self::from_alist_str(&text)
    }

    /// Number of check equations (rows of **H**).
    pub fn num_checks(&self) -> usize {
        self.num_checks
    }

    /// Codeword length in bits (columns of **H**).
    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    /// Information bits per codeword for the systematic construction.
    pub fn num_info_bits(&self) -> usize {
        self.num_vars - self.num_checks
    }

    /// Variable-node neighbours of check node `c`.
    #[inline]
    pub fn check_neighbors(&self, c: usize) -> &[usize] {
        &self.check_to_var[c]
    }

    /// Check-node neighbours of variable node `v`.
    #[inline]
    pub fn var_neighbors(&self, v: usize) -> &[usize] {
        &self.var_to_check[v]
    }

    /// Total number of 1-entries in **H**.
    pub fn num_edges(&self) -> usize {
        self.check_to_var.iter().map(Vec::len).sum()
    }

    /// Compute the syndrome **s** = **H** * **x** (mod 2).
    pub fn syndrome(&self, bits: &[u8]) -> Vec<u8> {
        let mut s = vec![0u8; self.num_checks];
        for (c, vars) in self.check_to_var.iter().enumerate() {
            for &v in vars {
                s[c] ^= bits[v] & 1;
            }
        }
        s
    }

    /// Number of unsatisfied check equations for `bits`.
    pub fn syndrome_weight(&self, bits: &[u8]) -> usize {
        self.syndrome(bits).iter().filter(|&&b| b != 0).count()
    }

    /// `true` iff `bits` is a valid codeword (zero syndrome).
    pub fn is_codeword(&self, bits: &[u8]) -> bool {
        self.syndrome_weight(bits) == 0
    }
}

fn parse_ints(line: &str) -> Result<Vec<usize>> {
    line.split_whitespace()
        .map(|tok| {
            tok.parse::<usize>()
                .map_err(|_| SleipnirError::AListMalformed(format!("non-integer token {tok:?}")))
        })
        .collect()
}

/// Small single-error-correcting code used by unit tests across the crate:
/// a (7,4) matrix with an identity parity block.
#[cfg(test)]
pub(crate) const TEST_ALIST_7_4: &str = "\
3 7
3 4
2 2 2 3 1 1 1
4 4 4
1 3 0
1 2 0
2 3 0
1 2 3
1 0 0
2 0 0
3 0 0
1 2 4 5
2 3 4 6
1 3 4 7
";

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
