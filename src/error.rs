use thiserror::Error;

use crate::session::SessionState;

/// Errors raised by parameter loading, observation handling, the balancer
/// and the inference session.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum Error {
    #[error("parameter [{block}][{index}] = {value} must be finite and strictly positive")]
    InvalidParameter {
        block: usize,
        index: usize,
        value: f64,
    },

    #[error("invalid parameter layout: {reason}")]
    InvalidParameterLayout { reason: String },

    #[error("invalid differentiation target ({block}, {index}): {reason}")]
    InvalidTarget {
        block: usize,
        index: usize,
        reason: &'static str,
    },

    #[error("invalid observation in row {row}: {reason}")]
    InvalidObservation { row: usize, reason: &'static str },

    #[error("the observation set is empty")]
    EmptyObservations,

    #[error("invalid hidden states: {reason}")]
    InvalidHiddenStates { reason: &'static str },

    #[error("invalid buffer layout: {reason}")]
    InvalidLayout { reason: String },

    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        name: &'static str,
        reason: &'static str,
    },

    /// The balancer could not find a sign change on its search interval.
    #[error("no root bracketed for survival level {level} on [{lower}, {upper}]")]
    RootNotBracketed { level: f64, lower: f64, upper: f64 },

    /// Failure reported by the root finder.
    #[error(transparent)]
    Solver(#[from] anyhow::Error),

    #[error("the computation was cancelled")]
    Cancelled,

    #[error("`{operation}` is not available in session state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The engine was queried for something it has not computed yet.
    #[error("{what} has not been computed")]
    NotComputed { what: &'static str },

    #[error("gammas were not saved during the last E-step (enable save_gamma)")]
    GammaNotSaved,
}

impl Error {
    /// Errors caused by malformed caller input.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidParameter { .. }
                | Error::InvalidParameterLayout { .. }
                | Error::InvalidTarget { .. }
                | Error::InvalidObservation { .. }
                | Error::EmptyObservations
                | Error::InvalidHiddenStates { .. }
                | Error::InvalidLayout { .. }
                | Error::InvalidArgument { .. }
        )
    }

    /// Errors raised by the numerical routines.
    pub fn is_numeric_error(&self) -> bool {
        matches!(self, Error::RootNotBracketed { .. } | Error::Solver(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
