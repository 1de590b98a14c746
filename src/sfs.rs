//! Expected site frequency spectra under a piecewise-exponential history.
//!
//! The number of ancestral lineages of a sample of `n` haplotypes follows
//! Tavare's pure-death distribution in the rescaled time `R(t)`. Integrating
//! it over a time window gives the expected time spent with `k` lineages in
//! that window; the branch-length spectrum then follows from the
//! probability that a branch among `k` lineages subtends `j` leaves, which
//! does not depend on the demography.

use crate::dual::Dual;
use crate::error::{Error, Result};
use crate::matrix::DualMatrix;
use crate::params::ParameterModel;
use crate::rate::RateFunction;

/// Largest sample size for which spectra are evaluated. Tavare's sums
/// alternate in sign and lose precision quickly beyond this point.
pub const MAX_SAMPLE_SIZE: usize = 25;

pub(crate) fn binomial(n: usize, k: usize) -> f64 {
    if k > n {
        return 0f64;
    }
    let k = k.min(n - k);
    (0..k).fold(1f64, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

fn factorial(n: usize) -> f64 {
    (1..=n).fold(1f64, |acc, i| acc * i as f64)
}

fn rising(x: usize, len: usize) -> f64 {
    (0..len).fold(1f64, |acc, i| acc * (x + i) as f64)
}

/// Coefficients `c[k][i]` with `P(A_n(t) = k) = sum_i c[k][i] exp(-C(i,2) R(t))`
/// for `2 <= k <= i <= n`.
fn lineage_coefficients(n: usize) -> Vec<Vec<f64>> {
    let mut coef = vec![vec![0f64; n + 1]; n + 1];
    for k in 2..=n {
        for i in k..=n {
            let sign = if (i - k) % 2 == 0 { 1f64 } else { -1f64 };
            let ratio: f64 = (0..i).map(|m| (n - m) as f64 / (n + m) as f64).product();
            coef[k][i] = sign * (2 * i - 1) as f64 * rising(k, i - 1) * ratio
                / (factorial(k) * factorial(i - k));
        }
    }
    coef
}

/// Expected total length of branches subtending `j` of `n` leaves within
/// `[lo, hi)`, for `j = 1..n`. Entry `j - 1` holds `E[L_j]`.
pub(crate) fn expected_branch_lengths(
    rate: &RateFunction,
    n: usize,
    lo: f64,
    hi: Option<f64>,
) -> Vec<Dual> {
    if n < 2 {
        return Vec::new();
    }
    let powers: Vec<f64> = (2..=n).map(|i| binomial(i, 2)).collect();
    let hi = hi.map(Dual::constant);
    let integrals = rate.integrate_survival(&powers, &Dual::constant(lo), hi.as_ref());
    let coef = lineage_coefficients(n);

    // Expected time with exactly k lineages, k = 2..=n.
    let mut times: Vec<Dual> = Vec::with_capacity(n + 1);
    times.push(Dual::constant(0f64));
    times.push(Dual::constant(0f64));
    for k in 2..=n {
        let mut total = Dual::constant(0f64);
        for i in k..=n {
            total.add_scaled(&integrals[i - 2], coef[k][i]);
        }
        times.push(total);
    }

    (1..n)
        .map(|j| {
            let mut length = Dual::constant(0f64);
            for k in 2..=(n - j + 1) {
                let weight =
                    k as f64 * binomial(n - j - 1, k - 2) / binomial(n - 1, k - 1);
                length.add_scaled(&times[k], weight);
            }
            length
        })
        .collect()
}

/// Expected joint spectrum of a distinguished pair and `n - 2` other
/// haplotypes, for mutations arising in the coalescent-time window
/// `[t1, t2)`.
///
/// Row `a` is the number of derived alleles in the pair, column `b` the
/// number among the remaining haplotypes. Entries where all or none of the
/// sample carry the derived allele are zero. The result carries one
/// derivative matrix per target of `params`.
pub fn sfs(n: usize, params: &ParameterModel, t1: f64, t2: f64, theta: f64) -> Result<DualMatrix> {
    if !(2..=MAX_SAMPLE_SIZE).contains(&n) {
        return Err(Error::InvalidArgument {
            name: "n",
            reason: "sample size must lie between 2 and MAX_SAMPLE_SIZE",
        });
    }
    if !(t1.is_finite() && t1 >= 0f64 && t2 > t1) {
        return Err(Error::InvalidArgument {
            name: "t1, t2",
            reason: "the window must satisfy 0 <= t1 < t2",
        });
    }
    if !(theta.is_finite() && theta > 0f64) {
        return Err(Error::InvalidArgument {
            name: "theta",
            reason: "must be finite and positive",
        });
    }

    let rate = RateFunction::new(params);
    let upper = t2.is_finite().then_some(t2);
    let lengths = expected_branch_lengths(&rate, n, t1, upper);

    let ncols = n - 1;
    let mut entries = Vec::with_capacity(3 * ncols);
    for a in 0..3usize {
        for b in 0..ncols {
            let j = a + b;
            if j == 0 || j >= n {
                entries.push(Dual::constant(0f64));
                continue;
            }
            let split = binomial(2, a) * binomial(n - 2, b) / binomial(n, j);
            entries.push(lengths[j - 1].scale(0.5 * theta * split));
        }
    }
    Ok(DualMatrix::from_duals(3, ncols, &entries, params.num_targets()))
}
