//! Discretization of coalescent time into hidden states.
//!
//! [`balance_hidden_states`] places the boundaries so that every interval
//! carries the same prior probability of pair coalescence, whatever the
//! shape of the rate function.

use argmin::core::{CostFunction, Executor, State};
use argmin::solver::brent::BrentRoot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::params::ParameterModel;
use crate::rate::RateFunction;

/// Upper bound on every hidden-state boundary, in coalescent units.
pub const T_MAX: f64 = 49.0;

/// Absolute tolerance of the boundary root finder.
const ROOT_TOLERANCE: f64 = 1e-12;
const MAX_ROOT_ITERATIONS: u64 = 200;

/// Check that `hidden_states` is a valid partition of `[0, T_MAX]`.
pub fn validate_hidden_states(hidden_states: &[f64]) -> Result<()> {
    let reason = if hidden_states.len() < 2 {
        Some("at least two boundaries are required")
    } else if hidden_states[0] != 0f64 {
        Some("the first boundary must be 0")
    } else if hidden_states.iter().any(|t| !t.is_finite()) {
        Some("boundaries must be finite")
    } else if hidden_states.windows(2).any(|w| w[1] <= w[0]) {
        Some("boundaries must be strictly increasing")
    } else if hidden_states[hidden_states.len() - 1] > T_MAX {
        Some("the last boundary exceeds T_MAX")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::InvalidHiddenStates { reason }),
        None => Ok(()),
    }
}

/// `exp(-R(t)) - level`, decreasing in `t`.
struct SurvivalGap<'a> {
    rate: &'a RateFunction,
    level: f64,
}

impl CostFunction for SurvivalGap<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, t: &f64) -> std::result::Result<f64, argmin::core::Error> {
        Ok((-self.rate.cumulative_value(*t)).exp() - self.level)
    }
}

/// Boundaries `0 = t_0 < t_1 < ... <= T_MAX` with `exp(-R(t_m)) = 1 - m/M`.
///
/// Solves for `m = 1..=M-2` and appends `T_MAX` if the last solved boundary
/// stays below it, so the result has `M` or `M + 1` entries. Only the values
/// of `params` are used.
pub fn balance_hidden_states(params: &ParameterModel, num_states: usize) -> Result<Vec<f64>> {
    if num_states < 2 {
        return Err(Error::InvalidArgument {
            name: "num_states",
            reason: "must be at least 2",
        });
    }
    let rate = RateFunction::new(&params.without_targets());
    let mut boundaries = Vec::with_capacity(num_states + 1);
    boundaries.push(0f64);

    for m in 1..num_states - 1 {
        let level = 1f64 - m as f64 / num_states as f64;
        let lower = boundaries[boundaries.len() - 1];
        let gap = SurvivalGap { rate: &rate, level };
        let (f_lower, f_upper) = (gap.cost(&lower)?, gap.cost(&T_MAX)?);
        if f_lower * f_upper > 0f64 {
            return Err(Error::RootNotBracketed {
                level,
                lower,
                upper: T_MAX,
            });
        }

        let solver = BrentRoot::new(lower, T_MAX, ROOT_TOLERANCE);
        let result = Executor::new(gap, solver)
            .configure(|state| state.param(lower).max_iters(MAX_ROOT_ITERATIONS))
            .run()?;
        let root = result
            .state()
            .get_param()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("root finder returned no solution for level {level}"))?;
        boundaries.push(root);
    }

    if boundaries[boundaries.len() - 1] < T_MAX {
        boundaries.push(T_MAX);
    }
    debug!(num_states, boundaries = ?boundaries, "balanced hidden states");
    Ok(boundaries)
}
