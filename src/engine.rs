//! The boundary between the EM driver and the numerical engine.

use std::collections::BTreeMap;

use faer::Mat;

use crate::dual::Dual;
use crate::error::Result;
use crate::matrix::DualMatrix;
use crate::observation::{BlockKey, Observation};
use crate::params::ParameterModel;
use crate::session::SessionOptions;

/// Everything an engine needs to be constructed. The session validates all
/// of it before an engine ever sees it.
#[derive(Debug, Clone, Copy)]
pub struct CoreInput<'a> {
    /// Total sample size: the distinguished pair plus the panel.
    pub n: usize,
    pub observations: &'a [Vec<Observation>],
    pub hidden_states: &'a [f64],
    pub theta: f64,
    pub rho: f64,
    pub options: SessionOptions,
}

/// Posterior statistics of one sequence.
#[derive(Debug, Clone, Default)]
pub struct Posterior {
    pub loglik: f64,
    /// Occupancy at the first site, used for the initial-state term of Q.
    pub gamma0: Vec<f64>,
    /// Occupancy at the last site of every row, `K x rows`, if saved.
    pub gammas: Option<Mat<f64>>,
    /// Summed occupancy per observation class, if computed.
    pub gamma_sums: Option<BTreeMap<BlockKey, Vec<f64>>>,
    /// Summed expected transitions, `K x K`, if computed.
    pub xisums: Option<Mat<f64>>,
}

/// A numerical engine computing HMM matrices and posterior statistics.
///
/// Implementations may assume validated input and may cache freely: the
/// driver decides which results are still meaningful after a parameter
/// update.
pub trait InferenceCore: Sized + Send {
    fn construct(input: CoreInput<'_>) -> Result<Self>;

    /// Recompute the parameter-dependent matrices.
    fn set_params(&mut self, model: &ParameterModel) -> Result<()>;

    /// Replace the hidden-state boundaries. Parameters must be set again
    /// afterwards.
    fn set_hidden_states(&mut self, hidden_states: &[f64]) -> Result<()>;

    /// Update the options that influence the posterior computation.
    fn set_options(&mut self, options: SessionOptions);

    /// Run forward-backward on every sequence. With `forward_backward_only`
    /// only the log-likelihood and occupancies are produced.
    fn e_step(&mut self, forward_backward_only: bool) -> Result<()>;

    /// Drop the statistics of the last E-step.
    fn discard_posteriors(&mut self);

    /// Log-likelihood per sequence under the current parameters.
    fn loglik(&mut self) -> Result<Vec<f64>>;

    /// Expected complete-data log-likelihood per sequence, using the
    /// posterior of the last E-step and the current parameters.
    fn q(&self) -> Result<Vec<Dual>>;

    fn regularizer(&self) -> Result<Dual>;

    /// Emission probability of every observation class, per hidden state.
    fn emission_probs(&self) -> Result<BTreeMap<BlockKey, DualMatrix>>;

    /// Statistics of the last E-step, one entry per sequence.
    fn posteriors(&self) -> &[Posterior];

    /// Per-row occupancies, if they were saved.
    fn gammas(&self) -> Option<Vec<&Mat<f64>>> {
        self.posteriors().iter().map(|p| p.gammas.as_ref()).collect()
    }

    /// Summed occupancies per observation class, if they were computed.
    fn gamma_sums(&self) -> Option<Vec<&BTreeMap<BlockKey, Vec<f64>>>> {
        self.posteriors()
            .iter()
            .map(|p| p.gamma_sums.as_ref())
            .collect()
    }

    /// Summed expected transitions, if they were computed.
    fn xisums(&self) -> Option<Vec<&Mat<f64>>> {
        self.posteriors().iter().map(|p| p.xisums.as_ref()).collect()
    }

    fn pi(&self) -> Result<DualMatrix>;

    fn transition(&self) -> Result<DualMatrix>;

    /// `K x classes`, columns ordered like [`InferenceCore::emission_probs`].
    fn emission(&self) -> Result<DualMatrix>;
}
