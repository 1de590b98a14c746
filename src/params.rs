//! Block-structured demographic parameters and their differentiation targets.

use std::collections::HashSet;

use crate::dual::Dual;
use crate::error::{Error, Result};

/// Position of a scalar inside a [`ParameterModel`] that derivatives are
/// taken with respect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    pub block: usize,
    pub index: usize,
}

impl Target {
    pub fn new(block: usize, index: usize) -> Self {
        Self { block, index }
    }
}

impl From<(usize, usize)> for Target {
    fn from((block, index): (usize, usize)) -> Self {
        Self { block, index }
    }
}

/// Maximum number of blocks: sizes at the recent end of each piece, sizes at
/// the ancient end, and piece spans.
pub const MAX_BLOCKS: usize = 3;

/// Ordered parameter blocks lifted to dual numbers.
///
/// Block 0 holds the population size at the start of each piece, the
/// optional block 1 the size at its end (exponential growth in between) and
/// the optional block 2 the length of each piece in coalescent units. All
/// blocks have the same length.
#[derive(Debug, Clone)]
pub struct ParameterModel {
    blocks: Vec<Vec<Dual>>,
    targets: Vec<Target>,
}

impl ParameterModel {
    /// Validate `blocks` and lift every scalar to a dual.
    ///
    /// Scalars listed in `targets` get the unit tangent of their position in
    /// that list, all others a zero tangent. Without targets no tangents are
    /// carried at all.
    pub fn build(blocks: &[Vec<f64>], targets: Option<&[Target]>) -> Result<Self> {
        if blocks.is_empty() || blocks.len() > MAX_BLOCKS {
            return Err(Error::InvalidParameterLayout {
                reason: format!(
                    "expected between 1 and {MAX_BLOCKS} blocks, got {}",
                    blocks.len()
                ),
            });
        }
        let pieces = blocks[0].len();
        if pieces == 0 {
            return Err(Error::InvalidParameterLayout {
                reason: "blocks must not be empty".into(),
            });
        }
        if let Some((block, values)) = blocks.iter().enumerate().find(|(_, b)| b.len() != pieces) {
            return Err(Error::InvalidParameterLayout {
                reason: format!(
                    "block {block} has {} entries, block 0 has {pieces}",
                    values.len()
                ),
            });
        }
        for (block, values) in blocks.iter().enumerate() {
            for (index, &value) in values.iter().enumerate() {
                if !(value.is_finite() && value > 0f64) {
                    return Err(Error::InvalidParameter {
                        block,
                        index,
                        value,
                    });
                }
            }
        }

        let targets = targets.unwrap_or(&[]).to_vec();
        let mut seen = HashSet::with_capacity(targets.len());
        for target in targets.iter() {
            if target.block >= blocks.len() || target.index >= pieces {
                return Err(Error::InvalidTarget {
                    block: target.block,
                    index: target.index,
                    reason: "out of range",
                });
            }
            if !seen.insert(*target) {
                return Err(Error::InvalidTarget {
                    block: target.block,
                    index: target.index,
                    reason: "listed more than once",
                });
            }
        }

        let dim = targets.len();
        let blocks = blocks
            .iter()
            .enumerate()
            .map(|(block, values)| {
                values
                    .iter()
                    .enumerate()
                    .map(|(index, &value)| {
                        match targets.iter().position(|t| *t == Target { block, index }) {
                            Some(pos) => Dual::variable(value, pos, dim),
                            None if dim == 0 => Dual::constant(value),
                            None => Dual::with_zero_tangents(value, dim),
                        }
                    })
                    .collect()
            })
            .collect();

        Ok(Self { blocks, targets })
    }

    /// A constant-size model: a single piece of size `size`.
    pub fn constant(size: f64) -> Result<Self> {
        Self::build(&[vec![size]], None)
    }

    pub fn blocks(&self) -> &[Vec<Dual>] {
        &self.blocks
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of pieces of the underlying rate function.
    pub fn num_pieces(&self) -> usize {
        self.blocks[0].len()
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Length of every tangent vector derived from this model.
    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn has_targets(&self) -> bool {
        !self.targets.is_empty()
    }

    /// The plain values, block by block.
    pub fn values(&self) -> Vec<Vec<f64>> {
        self.blocks
            .iter()
            .map(|block| block.iter().map(Dual::value).collect())
            .collect()
    }

    /// The same values without any tangents.
    pub fn without_targets(&self) -> Self {
        Self {
            blocks: self
                .blocks
                .iter()
                .map(|block| block.iter().map(|x| Dual::constant(x.value())).collect())
                .collect(),
            targets: Vec::new(),
        }
    }

    /// Size at the start of piece `k`.
    pub(crate) fn start_size(&self, k: usize) -> &Dual {
        &self.blocks[0][k]
    }

    /// Size at the end of piece `k`.
    pub(crate) fn end_size(&self, k: usize) -> &Dual {
        self.blocks.get(1).map_or(&self.blocks[0][k], |b| &b[k])
    }

    /// Length of piece `k`, or `None` when the model does not specify spans.
    pub(crate) fn span(&self, k: usize) -> Option<&Dual> {
        self.blocks.get(2).map(|b| &b[k])
    }

    /// Smoothness penalty on the size trajectory.
    ///
    /// Sums the squared differences of log sizes along
    /// `a_0, b_0, a_1, b_1, ..., a_{K-1}`. The last piece is constant, so its
    /// end size does not enter.
    pub fn regularizer(&self) -> Dual {
        let pieces = self.num_pieces();
        let mut sizes: Vec<&Dual> = Vec::with_capacity(2 * pieces);
        for k in 0..pieces {
            sizes.push(self.start_size(k));
            if k + 1 < pieces {
                sizes.push(self.end_size(k));
            }
        }
        let mut total = if self.has_targets() {
            Dual::with_zero_tangents(0f64, self.num_targets())
        } else {
            Dual::constant(0f64)
        };
        for pair in sizes.windows(2) {
            let diff = pair[1].ln().sub(&pair[0].ln());
            total.add_assign(&diff.mul(&diff));
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn lifts_targets_to_unit_tangents() -> anyhow::Result<()> {
        let targets = [Target::new(0, 1), Target::new(2, 0)];
        let model = ParameterModel::build(
            &[vec![1., 2.], vec![3., 4.], vec![0.5, 0.5]],
            Some(&targets),
        )?;
        assert_eq!(model.num_targets(), 2);
        assert_eq!(model.blocks()[0][1].tangents(), &[1., 0.]);
        assert_eq!(model.blocks()[2][0].tangents(), &[0., 1.]);
        assert_eq!(model.blocks()[1][0].tangents(), &[0., 0.]);
        Ok(())
    }

    #[test]
    fn without_targets_is_plain() -> anyhow::Result<()> {
        let model = ParameterModel::build(&[vec![1., 2.]], None)?;
        assert!(model.blocks().iter().flatten().all(Dual::is_constant));
        assert_eq!(model.values(), vec![vec![1., 2.]]);
        Ok(())
    }

    #[test]
    fn rejects_non_positive() {
        let err = ParameterModel::build(&[vec![1., 0.]], None).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidParameter {
                block: 0,
                index: 1,
                ..
            }
        ));
        assert!(ParameterModel::build(&[vec![f64::NAN]], None).is_err());
        assert!(ParameterModel::build(&[vec![-1.]], None)
            .unwrap_err()
            .is_input_error());
    }

    #[test]
    fn rejects_bad_layout_and_targets() {
        assert!(ParameterModel::build(&[], None).is_err());
        assert!(ParameterModel::build(&[vec![1.], vec![1., 2.]], None).is_err());
        let dup = [Target::new(0, 0), Target::new(0, 0)];
        assert!(matches!(
            ParameterModel::build(&[vec![1.]], Some(&dup)),
            Err(Error::InvalidTarget { .. })
        ));
        assert!(ParameterModel::build(&[vec![1.]], Some(&[Target::new(1, 0)])).is_err());
    }

    #[test]
    fn regularizer_penalizes_log_differences() -> anyhow::Result<()> {
        let model = ParameterModel::constant(2.)?;
        assert_eq!(model.regularizer().value(), 0.);

        let model = ParameterModel::build(&[vec![1., 4.]], Some(&[Target::new(0, 1)]))?;
        let reg = model.regularizer();
        // sizes: a0 = 1, b0 = 1, a1 = 4
        assert_abs_diff_eq!(reg.value(), 4f64.ln().powi(2), epsilon = 1e-12);
        assert_abs_diff_eq!(reg.tangents()[0], 2. * 4f64.ln() / 4., epsilon = 1e-12);
        Ok(())
    }
}
