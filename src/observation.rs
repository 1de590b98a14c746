//! Run-length encoded genotype observations.

use crate::error::{Error, Result};

/// Distinguished genotype code for a missing call.
pub const MISSING: i8 = -1;

/// A run of `span` consecutive sites sharing one observation class.
///
/// `a` counts derived alleles carried by the distinguished pair (`-1` when
/// missing), `b` the derived alleles among the `n_b` undistinguished
/// haplotypes observed at the site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Observation {
    pub span: u64,
    pub a: i8,
    pub b: u32,
    pub n_b: u32,
}

impl Observation {
    pub fn new(span: u64, a: i8, b: u32, n_b: u32) -> Self {
        Self { span, a, b, n_b }
    }

    pub fn key(&self) -> BlockKey {
        BlockKey {
            a: self.a,
            b: self.b,
            n_b: self.n_b,
        }
    }

    /// Fully uninformative: nothing observed in the pair or the panel.
    pub fn is_missing(&self) -> bool {
        self.a == MISSING && self.n_b == 0
    }

    /// Homozygous-derived pair together with an all-derived panel.
    ///
    /// Such sites are non-segregating and must be folded onto the ancestral
    /// class before they reach a session.
    pub fn is_unfolded_monomorphic(&self) -> bool {
        self.a == 2 && self.b == self.n_b
    }

    /// Parse a row-major `[span, a, b, n_b]` buffer.
    pub fn from_flat(data: &[i64]) -> Result<Vec<Observation>> {
        if data.len() % 4 != 0 {
            return Err(Error::InvalidLayout {
                reason: format!(
                    "expected rows of 4 columns, got a buffer of length {}",
                    data.len()
                ),
            });
        }
        data.chunks_exact(4)
            .enumerate()
            .map(|(row, chunk)| {
                let field = |value: i64, reason| {
                    u32::try_from(value).map_err(|_| Error::InvalidObservation { row, reason })
                };
                let span = u64::try_from(chunk[0]).map_err(|_| Error::InvalidObservation {
                    row,
                    reason: "span must be positive",
                })?;
                let a = i8::try_from(chunk[1]).map_err(|_| Error::InvalidObservation {
                    row,
                    reason: "a must be one of -1, 0, 1, 2",
                })?;
                let b = field(chunk[2], "b must be non-negative")?;
                let n_b = field(chunk[3], "n_b must be non-negative")?;
                Ok(Observation { span, a, b, n_b })
            })
            .collect()
    }

    /// The row as `[span, a, b, n_b]`.
    pub fn to_row(&self) -> [i64; 4] {
        [
            self.span as i64,
            self.a as i64,
            self.b as i64,
            self.n_b as i64,
        ]
    }
}

/// Observation class used to aggregate per-site statistics.
///
/// Emission probabilities and gamma sums are keyed by this triple so that
/// per-site tensors never need to be materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub a: i8,
    pub b: u32,
    pub n_b: u32,
}

impl BlockKey {
    pub fn new(a: i8, b: u32, n_b: u32) -> Self {
        Self { a, b, n_b }
    }
}

/// Check the row invariants of an observation sequence.
///
/// Rejects zero spans, genotype codes outside `-1..=2`, `b > n_b`, the
/// unfolded monomorphic class `a == 2 && b == n_b`, and sequences whose
/// total span does not fit in a `u64`.
pub fn validate_observation(observations: &[Observation]) -> Result<()> {
    for (row, obs) in observations.iter().enumerate() {
        let reason = if obs.span == 0 {
            Some("span must be positive")
        } else if !(MISSING..=2).contains(&obs.a) {
            Some("a must be one of -1, 0, 1, 2")
        } else if obs.b > obs.n_b {
            Some("b must not exceed n_b")
        } else if obs.is_unfolded_monomorphic() {
            Some("a == 2 and b == n_b: monomorphic sites must be folded before use")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(Error::InvalidObservation { row, reason });
        }
    }
    total_span(observations).map(|_| ())
}

/// Total number of sites covered by a sequence.
pub fn total_span(observations: &[Observation]) -> Result<u64> {
    observations
        .iter()
        .enumerate()
        .try_fold(0u64, |total, (row, obs)| {
            total
                .checked_add(obs.span)
                .ok_or(Error::InvalidObservation {
                    row,
                    reason: "total span overflows u64",
                })
        })
}
