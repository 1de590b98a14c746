//! Reference engine: a sequentially Markov coalescent HMM over the
//! coalescence time of a distinguished pair, with emissions that also use
//! the allele counts of an undistinguished panel.
//!
//! Hidden state `k` is the interval `[t_k, t_{k+1})` of the partition; the
//! last state absorbs everything above its lower boundary. All matrices are
//! computed with dual numbers so that the expected complete-data
//! log-likelihood carries derivatives with respect to the parameter targets.

use std::collections::{BTreeMap, BTreeSet};

use faer::Mat;
use rayon::prelude::*;
use tracing::{debug, trace};

use crate::engine::{CoreInput, InferenceCore, Posterior};
use crate::dual::Dual;
use crate::error::{Error, Result};
use crate::forward_backward::{forward_backward, log_likelihood, HmmValues};
use crate::matrix::{values, DualMatrix};
use crate::observation::{BlockKey, Observation, MISSING};
use crate::params::ParameterModel;
use crate::rate::RateFunction;
use crate::session::SessionOptions;
use crate::sfs::expected_branch_lengths;

/// Dual-valued HMM matrices for one parameter setting.
#[derive(Debug, Clone)]
struct Matrices {
    dim: usize,
    pi: Vec<Dual>,
    /// Row-major `K x K`.
    transition: Vec<Dual>,
    /// Row-major `classes x K`.
    emission: Vec<Dual>,
    values: HmmValues,
}

#[derive(Debug)]
pub struct CoalescentHmm {
    sample_size: usize,
    observations: Vec<Vec<Observation>>,
    /// Index into `keys` for every row of every sequence.
    classes: Vec<Vec<usize>>,
    /// Sorted distinct observation classes.
    keys: Vec<BlockKey>,
    hidden_states: Vec<f64>,
    theta: f64,
    rho: f64,
    options: SessionOptions,
    model: Option<ParameterModel>,
    matrices: Option<Matrices>,
    posteriors: Vec<Posterior>,
    loglik: Option<Vec<f64>>,
}

fn zero(dim: usize) -> Dual {
    if dim == 0 {
        Dual::constant(0f64)
    } else {
        Dual::with_zero_tangents(0f64, dim)
    }
}

/// Probability of `b` derived alleles among `n_b` panel haplotypes, for
/// `b = 0..=n_b`.
///
/// Weights are `1` for `b = 0` and `theta / 2 * E[L_b]` otherwise. The
/// all-derived count `b = n_b` is indistinguishable from a non-segregating
/// site and shares the probability of `b = 0`.
fn panel_spectrum(rate: &RateFunction, n_b: usize, theta: f64) -> Vec<Dual> {
    let mut weights = vec![Dual::constant(1f64)];
    weights.extend(
        expected_branch_lengths(rate, n_b, 0f64, None)
            .iter()
            .map(|length| length.scale(0.5 * theta)),
    );
    let total = Dual::sum(&weights);
    let mut probs: Vec<Dual> = weights.iter().map(|w| w.div(&total)).collect();
    probs.push(probs[0].clone());
    probs
}

impl CoalescentHmm {
    pub fn num_states(&self) -> usize {
        self.hidden_states.len() - 1
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Sorted distinct observation classes of all sequences.
    pub fn keys(&self) -> &[BlockKey] {
        &self.keys
    }

    /// Plain-valued transition matrix.
    pub fn transition_values(&self) -> Result<Mat<f64>> {
        let states = self.num_states();
        Ok(values(states, states, &self.matrices()?.transition))
    }

    fn matrices(&self) -> Result<&Matrices> {
        self.matrices.as_ref().ok_or(Error::NotComputed {
            what: "the HMM matrices",
        })
    }

    /// Bounds of hidden state `k`; `None` is infinity.
    fn interval(&self, k: usize) -> (f64, Option<f64>) {
        let lo = self.hidden_states[k];
        let hi = (k + 2 < self.hidden_states.len()).then(|| self.hidden_states[k + 1]);
        (lo, hi)
    }

    fn build_matrices(&self, model: &ParameterModel) -> Matrices {
        let rate = RateFunction::new(model);
        let dim = rate.dim();
        let states = self.num_states();
        let bound = |k: usize| Dual::constant(self.hidden_states[k]);

        // survival[k] = S(t_k), with S = 0 above the last state.
        let mut survival: Vec<Dual> = (0..states).map(|k| rate.survival(&bound(k))).collect();
        survival.push(rate.survival_at(None));
        let pi: Vec<Dual> = survival.windows(2).map(|s| s[0].sub(&s[1])).collect();
        let mean_times: Vec<Dual> = (0..states)
            .map(|k| {
                let (lo, hi) = self.interval(k);
                rate.conditional_time(lo, hi)
            })
            .collect();

        // Re-coalescence mass of a lineage detached in [t_j, h), spread over
        // the states it can join. Survival is taken relative to R(h), so
        // nothing overflows when S(t_k) underflows.
        let cumulative: Vec<Dual> = (0..states).map(|l| rate.cumulative(&bound(l))).collect();
        let spread = |j: usize, length: Dual, h: &Dual| -> Vec<Dual> {
            let r_h = rate.cumulative(h);
            let integral = rate.integrate_inverse_survival(&bound(j), h);
            let ratio = |l: usize| match cumulative.get(l) {
                Some(r_l) => r_l.sub(&r_h).neg().exp(),
                None => zero(dim),
            };
            let mut row = vec![zero(dim); states];
            row[j] = length.sub(&ratio(j + 1).mul(&integral));
            for (l, entry) in row.iter_mut().enumerate().skip(j + 1) {
                *entry = ratio(l).sub(&ratio(l + 1)).mul(&integral);
            }
            row
        };
        // below[k] sums the segments strictly under t_k.
        let mut below = vec![vec![zero(dim); states]];
        for j in 0..states.saturating_sub(1) {
            let full = spread(j, bound(j + 1).sub(&bound(j)), &bound(j + 1));
            let next: Vec<Dual> = below[j].iter().zip(&full).map(|(a, b)| a.add(b)).collect();
            below.push(next);
        }

        let mut transition = Vec::with_capacity(states * states);
        for (k, tbar) in mean_times.iter().enumerate() {
            // A recombination at height u, uniform on [0, tbar], lets the
            // detached lineage coalesce again at any time above u.
            let partial = spread(k, tbar.sub(&bound(k)), tbar);
            let recombination = tbar.scale(-self.rho).exp_m1().neg();
            let stay = recombination.neg().add_scalar(1f64);
            for (l, (under, part)) in below[k].iter().zip(&partial).enumerate() {
                let mut value = recombination.mul(&under.add(part).div(tbar));
                if l == k {
                    value.add_assign(&stay);
                }
                transition.push(value);
            }
        }

        let mut panels: BTreeMap<u32, Vec<Dual>> = BTreeMap::new();
        for key in self.keys.iter().filter(|key| key.n_b > 0) {
            panels
                .entry(key.n_b)
                .or_insert_with(|| panel_spectrum(&rate, key.n_b as usize, self.theta));
        }
        let eps = self.options.polarization_error;
        let mut emission = Vec::with_capacity(self.keys.len() * states);
        for key in self.keys.iter() {
            let panel = panels.get(&key.n_b).map(|probs| {
                let (b, n_b) = (key.b as usize, key.n_b as usize);
                probs[b].scale(1f64 - eps).add(&probs[n_b - b].scale(eps))
            });
            for tbar in mean_times.iter() {
                let mutated = tbar.scale(-self.theta);
                let pair = match key.a {
                    MISSING => Dual::constant(1f64),
                    1 => mutated.exp_m1().neg(),
                    _ => mutated.exp(),
                };
                emission.push(match panel.as_ref() {
                    Some(panel) => pair.mul(panel),
                    None => pair,
                });
            }
        }

        let values = HmmValues {
            num_states: states,
            pi: pi.iter().map(Dual::value).collect(),
            transition: transition.iter().map(Dual::value).collect(),
            emission: emission.iter().map(Dual::value).collect(),
        };
        debug!(
            states,
            classes = self.keys.len(),
            targets = dim,
            "computed HMM matrices"
        );
        Matrices {
            dim,
            pi,
            transition,
            emission,
            values,
        }
    }

    fn invalidate(&mut self) {
        self.posteriors.clear();
        self.loglik = None;
    }
}

impl InferenceCore for CoalescentHmm {
    fn construct(input: CoreInput<'_>) -> Result<Self> {
        let keys: Vec<BlockKey> = input
            .observations
            .iter()
            .flatten()
            .map(Observation::key)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let classes = input
            .observations
            .iter()
            .map(|rows| {
                rows.iter()
                    .map(|row| match keys.binary_search(&row.key()) {
                        Ok(class) | Err(class) => class,
                    })
                    .collect()
            })
            .collect();
        debug!(
            sequences = input.observations.len(),
            classes = keys.len(),
            n = input.n,
            "constructed coalescent HMM"
        );
        Ok(Self {
            sample_size: input.n,
            observations: input.observations.to_vec(),
            classes,
            keys,
            hidden_states: input.hidden_states.to_vec(),
            theta: input.theta,
            rho: input.rho,
            options: input.options,
            model: None,
            matrices: None,
            posteriors: Vec::new(),
            loglik: None,
        })
    }

    fn set_params(&mut self, model: &ParameterModel) -> Result<()> {
        self.matrices = Some(self.build_matrices(model));
        self.model = Some(model.clone());
        self.loglik = None;
        Ok(())
    }

    fn set_hidden_states(&mut self, hidden_states: &[f64]) -> Result<()> {
        self.hidden_states = hidden_states.to_vec();
        self.model = None;
        self.matrices = None;
        self.invalidate();
        Ok(())
    }

    fn set_options(&mut self, options: SessionOptions) {
        self.options = options;
        self.invalidate();
        if let Some(model) = self.model.take() {
            self.matrices = Some(self.build_matrices(&model));
            self.model = Some(model);
        }
    }

    fn e_step(&mut self, forward_backward_only: bool) -> Result<()> {
        let matrices = self.matrices()?;
        let (keys, options) = (&self.keys, &self.options);
        let posteriors: Vec<Posterior> = self
            .observations
            .par_iter()
            .zip(self.classes.par_iter())
            .map(|(rows, classes)| {
                forward_backward(
                    &matrices.values,
                    rows,
                    classes,
                    keys,
                    options,
                    forward_backward_only,
                )
            })
            .collect();
        trace!(sequences = posteriors.len(), "forward-backward finished");
        self.loglik = Some(posteriors.iter().map(|p| p.loglik).collect());
        self.posteriors = posteriors;
        Ok(())
    }

    fn discard_posteriors(&mut self) {
        self.posteriors.clear();
    }

    fn loglik(&mut self) -> Result<Vec<f64>> {
        if let Some(cached) = self.loglik.as_ref() {
            return Ok(cached.clone());
        }
        let matrices = self.matrices()?;
        let options = &self.options;
        let loglik: Vec<f64> = self
            .observations
            .par_iter()
            .zip(self.classes.par_iter())
            .map(|(rows, classes)| log_likelihood(&matrices.values, rows, classes, options))
            .collect();
        self.loglik = Some(loglik.clone());
        Ok(loglik)
    }

    fn q(&self) -> Result<Vec<Dual>> {
        let matrices = self.matrices()?;
        if self.posteriors.is_empty() {
            return Err(Error::NotComputed {
                what: "the posterior statistics",
            });
        }
        let states = self.num_states();
        let ln_pi: Vec<Dual> = matrices.pi.iter().map(Dual::ln).collect();
        let ln_transition: Vec<Dual> = matrices.transition.iter().map(Dual::ln).collect();
        let ln_emission: Vec<Dual> = matrices.emission.iter().map(Dual::ln).collect();

        self.posteriors
            .par_iter()
            .map(|post| {
                let missing = Error::NotComputed {
                    what: "the transition and class sums",
                };
                let (Some(xisums), Some(gamma_sums)) =
                    (post.xisums.as_ref(), post.gamma_sums.as_ref())
                else {
                    return Err(missing);
                };
                let mut total = zero(matrices.dim);
                for (&weight, ln) in post.gamma0.iter().zip(ln_pi.iter()) {
                    if weight > 0f64 {
                        total.add_scaled(ln, weight);
                    }
                }
                for i in 0..states {
                    for j in 0..states {
                        let weight = xisums[(i, j)];
                        if weight > 0f64 {
                            total.add_scaled(&ln_transition[i * states + j], weight);
                        }
                    }
                }
                for (key, sums) in gamma_sums.iter() {
                    let Ok(class) = self.keys.binary_search(key) else {
                        continue;
                    };
                    let row = &ln_emission[class * states..(class + 1) * states];
                    for (&weight, ln) in sums.iter().zip(row) {
                        if weight > 0f64 {
                            total.add_scaled(ln, weight);
                        }
                    }
                }
                Ok(total)
            })
            .collect()
    }

    fn regularizer(&self) -> Result<Dual> {
        self.model
            .as_ref()
            .map(ParameterModel::regularizer)
            .ok_or(Error::NotComputed {
                what: "the parameter model",
            })
    }

    fn emission_probs(&self) -> Result<BTreeMap<BlockKey, DualMatrix>> {
        let matrices = self.matrices()?;
        let states = self.num_states();
        Ok(self
            .keys
            .iter()
            .zip(matrices.emission.chunks_exact(states))
            .map(|(key, column)| (*key, DualMatrix::column(column, matrices.dim)))
            .collect())
    }

    fn posteriors(&self) -> &[Posterior] {
        &self.posteriors
    }

    fn pi(&self) -> Result<DualMatrix> {
        let matrices = self.matrices()?;
        Ok(DualMatrix::column(&matrices.pi, matrices.dim))
    }

    fn transition(&self) -> Result<DualMatrix> {
        let matrices = self.matrices()?;
        let states = self.num_states();
        Ok(DualMatrix::from_duals(
            states,
            states,
            &matrices.transition,
            matrices.dim,
        ))
    }

    fn emission(&self) -> Result<DualMatrix> {
        let matrices = self.matrices()?;
        let (states, classes) = (self.num_states(), self.keys.len());
        let transposed: Vec<Dual> = (0..states)
            .flat_map(|k| (0..classes).map(move |c| (k, c)))
            .map(|(k, c)| matrices.emission[c * states + k].clone())
            .collect();
        Ok(DualMatrix::from_duals(
            states,
            classes,
            &transposed,
            matrices.dim,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Target;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn sequences() -> Vec<Vec<Observation>> {
        vec![
            vec![
                Observation::new(40, 0, 0, 0),
                Observation::new(1, 1, 1, 4),
                Observation::new(25, 0, 0, 4),
                Observation::new(1, 1, 0, 0),
                Observation::new(30, -1, 0, 0),
                Observation::new(1, 2, 3, 4),
                Observation::new(20, 0, 0, 0),
            ],
            vec![
                Observation::new(10, 0, 0, 2),
                Observation::new(1, 0, 1, 2),
                Observation::new(60, 0, 0, 0),
                Observation::new(1, 1, 2, 2),
            ],
        ]
    }

    fn core(rows: &[Vec<Observation>], hidden_states: &[f64]) -> anyhow::Result<CoalescentHmm> {
        Ok(CoalescentHmm::construct(CoreInput {
            n: 6,
            observations: rows,
            hidden_states,
            theta: 0.05,
            rho: 0.03,
            options: SessionOptions::default(),
        })?)
    }

    const HIDDEN: [f64; 5] = [0., 0.2, 0.6, 1.4, 3.];

    fn history() -> Vec<Vec<f64>> {
        vec![vec![1.5, 0.4, 1.], vec![0.5, 1.2, 1.], vec![0.3, 0.9, 1.]]
    }

    #[test]
    fn matrices_are_stochastic() -> anyhow::Result<()> {
        let rows = sequences();
        let mut hmm = core(&rows, &HIDDEN)?;
        hmm.set_params(&ParameterModel::build(&history(), None)?)?;
        let k = hmm.num_states();
        assert_eq!(k, 4);

        let pi = hmm.pi()?;
        let total: f64 = (0..k).map(|i| pi.get(i, 0)).sum();
        assert_abs_diff_eq!(total, 1., epsilon = 1e-12);

        let t = hmm.transition_values()?;
        for i in 0..k {
            let row: f64 = (0..k).map(|j| t[(i, j)]).sum();
            assert_abs_diff_eq!(row, 1., epsilon = 1e-9);
            assert!((0..k).all(|j| t[(i, j)] > 0.));
        }

        let emission = hmm.emission()?;
        assert_eq!((emission.nrows(), emission.ncols()), (k, hmm.keys().len()));
        assert!(emission.jacobian().is_none());
        Ok(())
    }

    #[test]
    fn panel_spectrum_is_normalized() -> anyhow::Result<()> {
        let rate = RateFunction::new(&ParameterModel::constant(1.)?);
        for n_b in 1..6 {
            let probs = panel_spectrum(&rate, n_b, 0.1);
            assert_eq!(probs.len(), n_b + 1);
            let total: f64 = probs[..n_b].iter().map(Dual::value).sum();
            assert_abs_diff_eq!(total, 1., epsilon = 1e-12);
            assert_eq!(probs[0], probs[n_b]);
        }
        Ok(())
    }

    #[test]
    fn loglik_matches_e_step() -> anyhow::Result<()> {
        let rows = sequences();
        let mut hmm = core(&rows, &HIDDEN)?;
        hmm.set_params(&ParameterModel::build(&history(), None)?)?;
        let direct = hmm.loglik()?;
        hmm.e_step(true)?;
        let from_e_step = hmm.loglik()?;
        for (a, b) in direct.iter().zip(from_e_step.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
        assert!(hmm.q().is_err());
        Ok(())
    }

    #[test]
    fn q_derivative_with_fixed_posterior() -> anyhow::Result<()> {
        let rows = sequences();
        let values = history();
        let targets = [Target::new(0, 0), Target::new(1, 1), Target::new(2, 0)];
        let mut hmm = core(&rows, &HIDDEN)?;
        hmm.set_params(&ParameterModel::build(&values, Some(&targets))?)?;
        hmm.e_step(false)?;
        let q = hmm.q()?;

        let h = 1e-6;
        for (pos, target) in targets.iter().enumerate() {
            let mut at = |delta: f64| -> anyhow::Result<Vec<f64>> {
                let mut v = values.clone();
                v[target.block][target.index] += delta;
                hmm.set_params(&ParameterModel::build(&v, None)?)?;
                Ok(hmm.q()?.iter().map(Dual::value).collect())
            };
            let (plus, minus) = (at(h)?, at(-h)?);
            for (seq, qs) in q.iter().enumerate() {
                let fd = (plus[seq] - minus[seq]) / (2. * h);
                assert_abs_diff_eq!(qs.tangents()[pos], fd, epsilon = 1e-4 * (1. + fd.abs()));
            }
        }
        Ok(())
    }

    #[test]
    fn polarization_error_changes_emission() -> anyhow::Result<()> {
        let rows = sequences();
        let mut hmm = core(&rows, &HIDDEN)?;
        hmm.set_params(&ParameterModel::constant(1.)?)?;
        let before = hmm.emission_probs()?;
        hmm.set_options(SessionOptions {
            polarization_error: 0.1,
            ..Default::default()
        });
        let after = hmm.emission_probs()?;
        let key = BlockKey::new(1, 1, 4);
        assert!((before[&key].get(0, 0) - after[&key].get(0, 0)).abs() > 0.);
        // no panel, no change
        let key = BlockKey::new(1, 0, 0);
        assert_eq!(before[&key].get(2, 0), after[&key].get(2, 0));
        Ok(())
    }
}
