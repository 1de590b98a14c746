//! Scaled forward-backward recursion over run-length encoded sequences.

use std::collections::BTreeMap;

use faer::Mat;
use itertools::izip;

use crate::engine::Posterior;
use crate::observation::{BlockKey, Observation};
use crate::session::SessionOptions;

/// Fully missing runs longer than this are shortened when `span_cutoff` is
/// enabled. Their emissions are all one, so only the transition statistics
/// change.
pub const SPAN_CUTOFF: u64 = 10_000;

/// Plain-valued HMM matrices used by the recursion.
#[derive(Debug, Clone)]
pub(crate) struct HmmValues {
    pub(crate) num_states: usize,
    pub(crate) pi: Vec<f64>,
    /// Row-major `K x K`.
    pub(crate) transition: Vec<f64>,
    /// Row-major `classes x K`: one emission vector per observation class.
    pub(crate) emission: Vec<f64>,
}

impl HmmValues {
    fn emission_of(&self, class: usize) -> &[f64] {
        let k = self.num_states;
        &self.emission[class * k..(class + 1) * k]
    }
}

pub(crate) fn effective_span(obs: &Observation, options: &SessionOptions) -> u64 {
    if options.span_cutoff && obs.is_missing() {
        obs.span.min(SPAN_CUTOFF)
    } else {
        obs.span
    }
}

/// `out = (prev^T T) .* e`, normalized. Returns the normalizer.
fn propagate(prev: &[f64], transition: &[f64], emission: &[f64], out: &mut [f64]) -> f64 {
    let k = prev.len();
    out.fill(0f64);
    for (i, &p) in prev.iter().enumerate() {
        if p == 0f64 {
            continue;
        }
        let row = &transition[i * k..(i + 1) * k];
        out.iter_mut().zip(row).for_each(|(o, &t)| *o += p * t);
    }
    normalize_emitted(out, emission)
}

fn normalize_emitted(out: &mut [f64], emission: &[f64]) -> f64 {
    out.iter_mut().zip(emission).for_each(|(o, &e)| *o *= e);
    normalize(out)
}

fn normalize(out: &mut [f64]) -> f64 {
    let scale: f64 = out.iter().sum();
    let inv = scale.recip();
    out.iter_mut().for_each(|o| *o *= inv);
    scale
}

/// Whether a run of `len` identical sites is cheaper through matrix powers
/// (`O(K^3 log len)`) than site by site (`O(K^2 len)`).
fn by_powers(len: u64, k: usize) -> bool {
    let bits = u64::from(u64::BITS - len.leading_zeros());
    len > 2 * k as u64 * bits
}

/// `A = (T diag(e))^T`: one site maps a forward column `alpha` to `A alpha`.
fn step_matrix(values: &HmmValues, emission: &[f64]) -> Mat<f64> {
    let k = values.num_states;
    Mat::from_fn(k, k, |i, j| values.transition[j * k + i] * emission[i])
}

/// `A^n` and, when seeded with `B`, `sum_{s < n} A^s B A^(n - 1 - s)`,
/// both divided by `exp(log_scale)`.
struct Power {
    matrix: Mat<f64>,
    sum: Option<Mat<f64>>,
    log_scale: f64,
}

impl Power {
    fn of(step: &Mat<f64>, seed: Option<Mat<f64>>, mut n: u64) -> Self {
        let k = step.nrows();
        let mut acc = Power {
            matrix: Mat::identity(k, k),
            sum: seed.as_ref().map(|_| Mat::zeros(k, k)),
            log_scale: 0f64,
        };
        let mut base = Power {
            matrix: step.clone(),
            sum: seed,
            log_scale: 0f64,
        };
        while n > 0 {
            if n & 1 == 1 {
                acc = acc.then(&base);
            }
            n >>= 1;
            if n > 0 {
                base = base.then(&base);
            }
        }
        acc
    }

    /// Exponents add: `A^(m+n)` and `F_(m+n) = F_m A^n + A^m F_n`.
    fn then(&self, other: &Power) -> Power {
        let sum = match (self.sum.as_ref(), other.sum.as_ref()) {
            (Some(f_self), Some(f_other)) => {
                let left = f_self * &other.matrix;
                let right = &self.matrix * f_other;
                Some(&left + &right)
            }
            _ => None,
        };
        let mut out = Power {
            matrix: &self.matrix * &other.matrix,
            sum,
            log_scale: self.log_scale + other.log_scale,
        };
        out.rescale();
        out
    }

    fn rescale(&mut self) {
        let max_of = |m: &Mat<f64>| {
            let mut max = 0f64;
            for j in 0..m.ncols() {
                for i in 0..m.nrows() {
                    max = max.max(m[(i, j)].abs());
                }
            }
            max
        };
        let max = max_of(&self.matrix).max(self.sum.as_ref().map_or(0f64, max_of));
        if max == 0f64 || !max.is_finite() {
            return;
        }
        let inv = max.recip();
        for m in std::iter::once(&mut self.matrix).chain(self.sum.as_mut()) {
            for j in 0..m.ncols() {
                for i in 0..m.nrows() {
                    m[(i, j)] *= inv;
                }
            }
        }
        self.log_scale += max.ln();
    }
}

/// Move the normalized forward vector `alpha` across `len` sites of one
/// class. Returns the log of the accumulated normalizers.
fn advance(values: &HmmValues, class: usize, len: u64, alpha: &mut [f64]) -> f64 {
    if by_powers(len, values.num_states) {
        advance_by_powers(values, values.emission_of(class), len, alpha)
    } else {
        advance_by_sites(values, values.emission_of(class), len, alpha)
    }
}

fn advance_by_sites(values: &HmmValues, emission: &[f64], len: u64, alpha: &mut [f64]) -> f64 {
    let mut cur = vec![0f64; alpha.len()];
    let mut loglik = 0f64;
    for _ in 0..len {
        loglik += propagate(alpha, &values.transition, emission, &mut cur).ln();
        alpha.copy_from_slice(&cur);
    }
    loglik
}

fn advance_by_powers(values: &HmmValues, emission: &[f64], len: u64, alpha: &mut [f64]) -> f64 {
    let power = Power::of(&step_matrix(values, emission), None, len);
    let next: Vec<f64> = (0..alpha.len())
        .map(|i| {
            alpha
                .iter()
                .enumerate()
                .map(|(j, &a)| power.matrix[(i, j)] * a)
                .sum::<f64>()
        })
        .collect();
    alpha.copy_from_slice(&next);
    normalize(alpha).ln() + power.log_scale
}

/// Accumulators for the sites of one run.
struct RunSums<'a> {
    /// Row-major `K x K` expected transitions into the run's sites.
    xi: &'a mut [f64],
    /// Expected occupancy of the run's sites.
    occupancy: &'a mut [f64],
}

/// Move the backward vector `beta` from the last site of a run of `len`
/// sites back to the site before it, whose forward vector is `alpha_start`.
fn retreat(
    values: &HmmValues,
    class: usize,
    len: u64,
    alpha_start: &[f64],
    beta: &mut [f64],
    sums: Option<RunSums<'_>>,
) {
    let emission = values.emission_of(class);
    if by_powers(len, values.num_states) {
        retreat_by_powers(values, emission, len, alpha_start, beta, sums)
    } else {
        retreat_by_sites(values, emission, len, alpha_start, beta, sums)
    }
}

fn retreat_by_sites(
    values: &HmmValues,
    emission: &[f64],
    len: u64,
    alpha_start: &[f64],
    beta: &mut [f64],
    sums: Option<RunSums<'_>>,
) {
    let k = values.num_states;
    let mut weighted = vec![0f64; k];
    let mut previous = vec![0f64; k];
    let step_back = |beta: &[f64], weighted: &mut [f64], previous: &mut [f64]| {
        izip!(weighted.iter_mut(), emission, beta).for_each(|(w, &e, &b)| *w = e * b);
        for (i, p) in previous.iter_mut().enumerate() {
            *p = values.transition[i * k..(i + 1) * k]
                .iter()
                .zip(weighted.iter())
                .map(|(t, w)| t * w)
                .sum();
        }
    };

    let Some(mut sums) = sums else {
        for _ in 0..len {
            step_back(beta, &mut weighted, &mut previous);
            normalize(&mut previous);
            beta.copy_from_slice(&previous);
        }
        return;
    };

    // Forward vectors inside the run; short runs only, so this stays small.
    let mut alphas = alpha_start.to_vec();
    let mut cur = vec![0f64; k];
    for site in 0..len as usize {
        propagate(&alphas[site * k..(site + 1) * k], &values.transition, emission, &mut cur);
        alphas.extend_from_slice(&cur);
    }

    let mut gamma = vec![0f64; k];
    for site in (1..=len as usize).rev() {
        let here = &alphas[site * k..(site + 1) * k];
        let before = &alphas[(site - 1) * k..site * k];
        izip!(gamma.iter_mut(), here, beta.iter()).for_each(|(g, &a, &b)| *g = a * b);
        normalize(&mut gamma);
        sums.occupancy
            .iter_mut()
            .zip(gamma.iter())
            .for_each(|(o, &g)| *o += g);

        step_back(beta, &mut weighted, &mut previous);
        let z: f64 = before.iter().zip(previous.iter()).map(|(a, p)| a * p).sum();
        for (i, &a) in before.iter().enumerate() {
            if a == 0f64 {
                continue;
            }
            let row = &values.transition[i * k..(i + 1) * k];
            izip!(sums.xi[i * k..(i + 1) * k].iter_mut(), row, weighted.iter())
                .for_each(|(x, &t, &w)| *x += a * t * w / z);
        }
        normalize(&mut previous);
        beta.copy_from_slice(&previous);
    }
}

fn retreat_by_powers(
    values: &HmmValues,
    emission: &[f64],
    len: u64,
    alpha_start: &[f64],
    beta: &mut [f64],
    sums: Option<RunSums<'_>>,
) {
    let k = values.num_states;
    let seed = sums
        .is_some()
        .then(|| Mat::from_fn(k, k, |i, j| alpha_start[i] * beta[j]));
    let power = Power::of(&step_matrix(values, emission), seed, len);
    // (T diag(e))^len beta
    let mut previous: Vec<f64> = (0..k)
        .map(|i| (0..k).map(|j| power.matrix[(j, i)] * beta[j]).sum::<f64>())
        .collect();

    if let (Some(mut sums), Some(pairs)) = (sums, power.sum.as_ref()) {
        // pairs[(i, j)] sums alpha_(s-1)(i) beta_s(j) over the run, with the
        // same scale as `previous`.
        let z: f64 = alpha_start.iter().zip(previous.iter()).map(|(a, p)| a * p).sum();
        for i in 0..k {
            for j in 0..k {
                let w = values.transition[i * k + j] * emission[j] * pairs[(i, j)] / z;
                sums.xi[i * k + j] += w;
                sums.occupancy[j] += w;
            }
        }
    }
    normalize(&mut previous);
    beta.copy_from_slice(&previous);
}

/// Forward pass over whole rows. `row_end` sees the normalized forward
/// vector at the last site of every row. Returns the log-likelihood and the
/// forward vector at the first site.
fn forward_rows(
    values: &HmmValues,
    spans: &[u64],
    classes: &[usize],
    mut row_end: impl FnMut(usize, &[f64]),
) -> (f64, Vec<f64>) {
    let mut alpha = values.pi.clone();
    let Some(&first) = classes.first() else {
        return (0f64, alpha);
    };
    let mut loglik = normalize_emitted(&mut alpha, values.emission_of(first)).ln();
    let initial = alpha.clone();
    for (row, (&span, &class)) in spans.iter().zip(classes).enumerate() {
        let len = if row == 0 { span - 1 } else { span };
        loglik += advance(values, class, len, &mut alpha);
        row_end(row, &alpha);
    }
    (loglik, initial)
}

/// Log-likelihood of one sequence, without storing the forward variables.
pub(crate) fn log_likelihood(
    values: &HmmValues,
    rows: &[Observation],
    classes: &[usize],
    options: &SessionOptions,
) -> f64 {
    let spans: Vec<u64> = rows.iter().map(|row| effective_span(row, options)).collect();
    forward_rows(values, &spans, classes, |_, _| {}).0
}

/// Posterior statistics of one sequence.
///
/// Memory and time grow with the number of rows, not with the number of
/// sites: forward vectors are kept only at row ends and long runs are
/// crossed with matrix powers. With `forward_backward_only` the transition
/// sums and the per-class occupancy sums are skipped.
pub(crate) fn forward_backward(
    values: &HmmValues,
    rows: &[Observation],
    classes: &[usize],
    keys: &[BlockKey],
    options: &SessionOptions,
    forward_backward_only: bool,
) -> Posterior {
    let k = values.num_states;
    let spans: Vec<u64> = rows.iter().map(|row| effective_span(row, options)).collect();
    let mut row_ends = vec![0f64; rows.len() * k];
    let (loglik, initial) = forward_rows(values, &spans, classes, |row, alpha| {
        row_ends[row * k..(row + 1) * k].copy_from_slice(alpha)
    });

    let mut gammas = options.save_gamma.then(|| Mat::<f64>::zeros(k, rows.len()));
    let mut class_sums = (!forward_backward_only).then(|| vec![vec![0f64; k]; keys.len()]);
    let mut xi = (!forward_backward_only).then(|| vec![0f64; k * k]);
    let mut gamma0 = vec![0f64; k];

    let mut beta = vec![1f64; k];
    let mut gamma = vec![0f64; k];
    for (row, (&span, &class)) in spans.iter().zip(classes).enumerate().rev() {
        if let Some(gammas) = gammas.as_mut() {
            let alpha = &row_ends[row * k..(row + 1) * k];
            izip!(gamma.iter_mut(), alpha, beta.iter()).for_each(|(g, &a, &b)| *g = a * b);
            normalize(&mut gamma);
            for (i, &g) in gamma.iter().enumerate() {
                gammas[(i, row)] = g;
            }
        }
        let (alpha_start, len) = if row == 0 {
            (&initial[..], span - 1)
        } else {
            (&row_ends[(row - 1) * k..row * k], span)
        };
        let sums = match (xi.as_mut(), class_sums.as_mut()) {
            (Some(xi), Some(class_sums)) => Some(RunSums {
                xi,
                occupancy: &mut class_sums[class],
            }),
            _ => None,
        };
        retreat(values, class, len, alpha_start, &mut beta, sums);
    }
    if let Some(&first) = classes.first() {
        izip!(gamma0.iter_mut(), initial.iter(), beta.iter()).for_each(|(g, &a, &b)| *g = a * b);
        normalize(&mut gamma0);
        if let Some(sums) = class_sums.as_mut() {
            sums[first]
                .iter_mut()
                .zip(gamma0.iter())
                .for_each(|(s, &g)| *s += g);
        }
    }

    let xisums = xi.map(|acc| Mat::from_fn(k, k, |i, j| acc[i * k + j]));
    let gamma_sums = class_sums.map(|sums| {
        let mut present = vec![false; keys.len()];
        classes.iter().for_each(|&c| present[c] = true);
        keys.iter()
            .zip(sums)
            .zip(present)
            .filter(|(_, present)| *present)
            .map(|((key, sum), _)| (*key, sum))
            .collect::<BTreeMap<_, _>>()
    });

    Posterior {
        loglik,
        gamma0,
        gammas,
        gamma_sums,
        xisums,
    }
}
