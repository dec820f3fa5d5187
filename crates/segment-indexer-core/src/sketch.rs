//! Mergeable HyperLogLog distinct-count sketch.
//!
//! Metric aggregation needs a distinct-count estimator that can fold row
//! by row, merge partial results from independent workers, and keep no
//! raw values (bounded memory). This is a dense HyperLogLog:
//!
//! - `2^precision` one-byte registers; precision 4..=16.
//! - Values are hashed with blake3 under the fixed domain tag
//!   `hll-value-v1`, taking the first 8 digest bytes as a little-endian
//!   `u64`. The hash is part of the sketch's identity: two sketches only
//!   merge meaningfully when both were fed through this same function,
//!   which is why hashing lives inside [`HllSketch::add`] rather than at
//!   call sites.
//! - `estimate` applies the usual bias-corrected harmonic mean with a
//!   linear-counting fallback for small cardinalities. No large-range
//!   correction; segment-level cardinalities stay far below 2^32.
//!
//! The byte encoding (`to_bytes`/`from_bytes`) is one precision byte
//! followed by the raw registers; it is what segment files store in the
//! sketch metric column.

use snafu::{Backtrace, Snafu};

/// Smallest supported sketch precision (16 registers).
pub const MIN_PRECISION: u8 = 4;
/// Largest supported sketch precision (65536 registers).
pub const MAX_PRECISION: u8 = 16;

const HLL_VALUE_TAG: &[u8] = b"hll-value-v1";

/// Errors raised by sketch merge and decode operations.
#[derive(Debug, Snafu)]
pub enum SketchError {
    /// Two sketches with different precisions cannot be merged.
    #[snafu(display("Cannot merge sketches with precisions {left} and {right}"))]
    PrecisionMismatch {
        /// Precision of the receiving sketch.
        left: u8,
        /// Precision of the other sketch.
        right: u8,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The requested precision is outside the supported 4..=16 range.
    #[snafu(display("Unsupported sketch precision {precision} (need 4..=16)"))]
    UnsupportedPrecision {
        /// The offending precision.
        precision: u8,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },

    /// The byte encoding is truncated or inconsistent.
    #[snafu(display("Malformed sketch encoding ({len} bytes)"))]
    BadEncoding {
        /// Length of the rejected byte slice.
        len: usize,
        /// The backtrace at the time the error occurred.
        backtrace: Backtrace,
    },
}

/// Dense HyperLogLog sketch.
///
/// Adding is idempotent per value, and merging takes the per-register
/// maximum, so any interleaving of `add` and `merge` over the same value
/// sets produces identical registers. That makes the fold commutative
/// and associative, which the aggregation layer relies on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HllSketch {
    precision: u8,
    registers: Vec<u8>,
}

impl HllSketch {
    /// Create an empty sketch with `2^precision` registers.
    pub fn new(precision: u8) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return UnsupportedPrecisionSnafu { precision }.fail();
        }
        Ok(Self {
            precision,
            registers: vec![0u8; 1usize << precision],
        })
    }

    /// Precision this sketch was created with.
    pub fn precision(&self) -> u8 {
        self.precision
    }

    /// Fold one value into the sketch.
    pub fn add(&mut self, value: &[u8]) {
        self.add_hash(hash_value(value));
    }

    fn add_hash(&mut self, h: u64) {
        let m = self.registers.len() as u64;
        let idx = (h & (m - 1)) as usize;

        // Rank = position of the lowest set bit in the remaining hash
        // bits, one-based; an all-zero remainder caps at the maximum
        // observable rank for this precision.
        let rest = h >> self.precision;
        let max_rank = 64 - u32::from(self.precision);
        let rank = (rest.trailing_zeros().min(max_rank) + 1) as u8;

        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Merge another partial sketch into this one (per-register maximum).
    pub fn merge(&mut self, other: &HllSketch) -> Result<(), SketchError> {
        if self.precision != other.precision {
            return PrecisionMismatchSnafu {
                left: self.precision,
                right: other.precision,
            }
            .fail();
        }
        for (dst, src) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *src > *dst {
                *dst = *src;
            }
        }
        Ok(())
    }

    /// Estimate the number of distinct values added so far.
    pub fn estimate(&self) -> f64 {
        let m = self.registers.len() as f64;

        let mut inverse_sum = 0.0f64;
        let mut zero_registers = 0u64;
        for &r in &self.registers {
            inverse_sum += 1.0 / (1u64 << u32::from(r)) as f64;
            if r == 0 {
                zero_registers += 1;
            }
        }

        let alpha = match self.registers.len() {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            len => 0.7213 / (1.0 + 1.079 / (len as f64)),
        };
        let raw = alpha * m * m / inverse_sum;

        // Small-range correction: linear counting while empty registers
        // remain and the raw estimate is below 2.5m.
        if raw <= 2.5 * m && zero_registers > 0 {
            m * (m / zero_registers as f64).ln()
        } else {
            raw
        }
    }

    /// Compact encoding: one precision byte, then the raw registers.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.registers.len());
        out.push(self.precision);
        out.extend_from_slice(&self.registers);
        out
    }

    /// Decode a sketch produced by [`HllSketch::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SketchError> {
        let (&precision, registers) = bytes
            .split_first()
            .ok_or_else(|| BadEncodingSnafu { len: bytes.len() }.build())?;
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
            return UnsupportedPrecisionSnafu { precision }.fail();
        }
        if registers.len() != 1usize << precision {
            return BadEncodingSnafu { len: bytes.len() }.fail();
        }
        Ok(Self {
            precision,
            registers: registers.to_vec(),
        })
    }
}

/// Stable value hash: blake3 under the `hll-value-v1` domain tag, first
/// 8 digest bytes as little-endian `u64`. Fixed so sketches built by
/// independent workers agree; never a process-seeded hasher.
fn hash_value(value: &[u8]) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(HLL_VALUE_TAG);
    hasher.update(b"\0");
    hasher.update(value);

    let digest = hasher.finalize();
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(first)
}
