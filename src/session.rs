//! The EM driver: owns the data and the engine, and decides which derived
//! quantities are meaningful at any point of the iteration.

use std::collections::BTreeMap;

use faer::Mat;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::coalescent_hmm::CoalescentHmm;
use crate::engine::{CoreInput, InferenceCore};
use crate::dual::Dual;
use crate::error::{Error, Result};
use crate::hidden_states::validate_hidden_states;
use crate::matrix::DualMatrix;
use crate::observation::{validate_observation, BlockKey, Observation};
use crate::params::{ParameterModel, Target};
use crate::sfs::MAX_SAMPLE_SIZE;

/// Settings that influence the posterior computation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionOptions {
    /// Shorten fully missing runs to [`crate::SPAN_CUTOFF`] sites.
    pub span_cutoff: bool,
    /// Keep the per-row occupancies of the last E-step.
    pub save_gamma: bool,
    /// Probability that the ancestral and derived alleles of the panel are
    /// swapped. Must lie in `[0, 0.5)`.
    pub polarization_error: f64,
}

impl SessionOptions {
    fn validate(&self) -> Result<()> {
        if !(0f64..0.5).contains(&self.polarization_error) {
            return Err(Error::InvalidArgument {
                name: "polarization_error",
                reason: "must lie in [0, 0.5)",
            });
        }
        Ok(())
    }
}

/// Where a session is in the EM iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No parameters have been supplied yet.
    Created,
    /// Matrices are current, no posterior is available.
    ParametersSet,
    /// Posterior statistics of the current parameters are available.
    EStepped { forward_backward_only: bool },
}

/// What an accessor needs from the session state.
#[derive(Debug, Clone, Copy)]
enum Requires {
    Parameters,
    Posterior,
    FullPosterior,
}

/// An EM session over a fixed set of observation sequences.
///
/// Every parameter update discards the statistics of the previous E-step,
/// so a posterior is only ever combined with the parameters it was computed
/// under.
#[derive(Debug)]
pub struct InferenceSession<C: InferenceCore = CoalescentHmm> {
    n: usize,
    theta: f64,
    rho: f64,
    hidden_states: Vec<f64>,
    options: SessionOptions,
    num_sequences: usize,
    model: Option<ParameterModel>,
    state: SessionState,
    cancel: CancellationToken,
    core: C,
}

impl<C: InferenceCore> InferenceSession<C> {
    /// Validate the inputs and construct the engine.
    ///
    /// `n` is the total sample size: the distinguished pair plus `n - 2`
    /// panel haplotypes.
    #[instrument(level = "debug", skip_all, fields(n = n, sequences = observations.len()))]
    pub fn new(
        n: usize,
        observations: Vec<Vec<Observation>>,
        hidden_states: Vec<f64>,
        theta: f64,
        rho: f64,
        options: SessionOptions,
    ) -> Result<Self> {
        if !(2..=MAX_SAMPLE_SIZE + 2).contains(&n) {
            return Err(Error::InvalidArgument {
                name: "n",
                reason: "the panel size n - 2 must lie between 0 and MAX_SAMPLE_SIZE",
            });
        }
        if !(theta.is_finite() && theta > 0f64) {
            return Err(Error::InvalidArgument {
                name: "theta",
                reason: "must be finite and positive",
            });
        }
        if !(rho.is_finite() && rho > 0f64) {
            return Err(Error::InvalidArgument {
                name: "rho",
                reason: "must be finite and positive",
            });
        }
        options.validate()?;
        if observations.is_empty() || observations.iter().any(Vec::is_empty) {
            return Err(Error::EmptyObservations);
        }
        for rows in observations.iter() {
            validate_observation(rows)?;
            if let Some(row) = rows.iter().position(|obs| obs.n_b as usize > n - 2) {
                return Err(Error::InvalidObservation {
                    row,
                    reason: "n_b exceeds the panel size n - 2",
                });
            }
        }
        validate_hidden_states(&hidden_states)?;

        let core = C::construct(CoreInput {
            n,
            observations: &observations,
            hidden_states: &hidden_states,
            theta,
            rho,
            options,
        })?;
        info!(
            sequences = observations.len(),
            states = hidden_states.len() - 1,
            "created inference session"
        );
        Ok(Self {
            n,
            theta,
            rho,
            hidden_states,
            options,
            num_sequences: observations.len(),
            model: None,
            state: SessionState::Created,
            cancel: CancellationToken::new(),
            core,
        })
    }

    fn require(&self, operation: &'static str, requires: Requires) -> Result<()> {
        let allowed = match (requires, self.state) {
            (_, SessionState::Created) => false,
            (Requires::Parameters, _) => true,
            (Requires::Posterior, SessionState::EStepped { .. }) => true,
            (
                Requires::FullPosterior,
                SessionState::EStepped {
                    forward_backward_only: false,
                },
            ) => true,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    /// Install new parameters.
    ///
    /// A pending cancellation is consumed here: the update is skipped, the
    /// session keeps its previous state and [`Error::Cancelled`] is returned.
    #[instrument(level = "debug", skip_all, fields(targets = model.num_targets()))]
    pub fn set_params(&mut self, model: ParameterModel) -> Result<()> {
        if self.cancel.take() {
            warn!("cancellation requested, parameter update skipped");
            return Err(Error::Cancelled);
        }
        self.core.set_params(&model)?;
        self.core.discard_posteriors();
        debug!(values = ?model.values(), "parameters set");
        self.model = Some(model);
        self.state = SessionState::ParametersSet;
        Ok(())
    }

    /// Run forward-backward on every sequence.
    #[instrument(level = "debug", skip(self))]
    pub fn e_step(&mut self, forward_backward_only: bool) -> Result<()> {
        self.require("e_step", Requires::Parameters)?;
        self.core.e_step(forward_backward_only)?;
        self.state = SessionState::EStepped {
            forward_backward_only,
        };
        if let Ok(loglik) = self.core.loglik() {
            info!(
                loglik = loglik.iter().sum::<f64>(),
                forward_backward_only, "E-step finished"
            );
        }
        Ok(())
    }

    /// Expected complete-data log-likelihood per sequence, with derivatives
    /// for every target of the current parameters.
    pub fn q(&self) -> Result<Vec<Dual>> {
        self.require("q", Requires::FullPosterior)?;
        self.core.q()
    }

    /// Log-likelihood per sequence under the current parameters.
    pub fn loglik(&mut self) -> Result<Vec<f64>> {
        self.require("loglik", Requires::Parameters)?;
        self.core.loglik()
    }

    pub fn regularizer(&self) -> Result<Dual> {
        self.require("regularizer", Requires::Parameters)?;
        self.core.regularizer()
    }

    pub fn pi(&self) -> Result<DualMatrix> {
        self.require("pi", Requires::Parameters)?;
        self.core.pi()
    }

    pub fn transition(&self) -> Result<DualMatrix> {
        self.require("transition", Requires::Parameters)?;
        self.core.transition()
    }

    pub fn emission(&self) -> Result<DualMatrix> {
        self.require("emission", Requires::Parameters)?;
        self.core.emission()
    }

    pub fn emission_probs(&self) -> Result<BTreeMap<BlockKey, DualMatrix>> {
        self.require("emission_probs", Requires::Parameters)?;
        self.core.emission_probs()
    }

    /// Occupancy at the last site of every row, one `K x rows` matrix per
    /// sequence. Needs `save_gamma`.
    pub fn gammas(&self) -> Result<Vec<&Mat<f64>>> {
        self.require("gammas", Requires::Posterior)?;
        if !self.options.save_gamma {
            return Err(Error::GammaNotSaved);
        }
        self.core.gammas().ok_or(Error::GammaNotSaved)
    }

    pub fn gamma_sums(&self) -> Result<Vec<&BTreeMap<BlockKey, Vec<f64>>>> {
        self.require("gamma_sums", Requires::FullPosterior)?;
        self.core.gamma_sums().ok_or(Error::NotComputed {
            what: "the class occupancy sums",
        })
    }

    pub fn xisums(&self) -> Result<Vec<&Mat<f64>>> {
        self.require("xisums", Requires::FullPosterior)?;
        self.core.xisums().ok_or(Error::NotComputed {
            what: "the transition sums",
        })
    }

    pub fn hidden_states(&self) -> &[f64] {
        &self.hidden_states
    }

    /// Replace the partition. Current parameters, if any, are applied again
    /// without looking at the cancellation token.
    pub fn set_hidden_states(&mut self, hidden_states: Vec<f64>) -> Result<()> {
        validate_hidden_states(&hidden_states)?;
        self.core.set_hidden_states(&hidden_states)?;
        self.hidden_states = hidden_states;
        self.state = match self.model.as_ref() {
            Some(model) => {
                self.core.set_params(model)?;
                SessionState::ParametersSet
            }
            None => SessionState::Created,
        };
        debug!(states = self.hidden_states.len() - 1, "hidden states replaced");
        Ok(())
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    fn update_options(&mut self, options: SessionOptions) -> Result<()> {
        options.validate()?;
        self.options = options;
        self.core.set_options(options);
        if let SessionState::EStepped { .. } = self.state {
            self.state = SessionState::ParametersSet;
        }
        Ok(())
    }

    pub fn span_cutoff(&self) -> bool {
        self.options.span_cutoff
    }

    pub fn set_span_cutoff(&mut self, span_cutoff: bool) -> Result<()> {
        self.update_options(SessionOptions {
            span_cutoff,
            ..self.options
        })
    }

    pub fn save_gamma(&self) -> bool {
        self.options.save_gamma
    }

    pub fn set_save_gamma(&mut self, save_gamma: bool) -> Result<()> {
        self.update_options(SessionOptions {
            save_gamma,
            ..self.options
        })
    }

    pub fn set_polarization_error(&mut self, polarization_error: f64) -> Result<()> {
        self.update_options(SessionOptions {
            polarization_error,
            ..self.options
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// A handle that cancels the next parameter update when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn params(&self) -> Option<&ParameterModel> {
        self.model.as_ref()
    }

    /// Differentiation targets of the current parameters.
    pub fn targets(&self) -> &[Target] {
        self.model
            .as_ref()
            .map(ParameterModel::targets)
            .unwrap_or_default()
    }

    pub fn sample_size(&self) -> usize {
        self.n
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn rho(&self) -> f64 {
        self.rho
    }

    pub fn num_sequences(&self) -> usize {
        self.num_sequences
    }

    pub fn core(&self) -> &C {
        &self.core
    }
}
