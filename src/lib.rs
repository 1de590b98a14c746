pub(crate) mod cancel;
pub(crate) mod coalescent_hmm;
pub(crate) mod dual;
pub(crate) mod engine;
pub(crate) mod error;
pub(crate) mod forward_backward;
pub(crate) mod hidden_states;
pub(crate) mod matrix;
pub(crate) mod observation;
pub(crate) mod params;
pub(crate) mod quadrature;
pub(crate) mod rate;
pub(crate) mod session;
pub(crate) mod sfs;
pub(crate) mod thin;

pub use cancel::CancellationToken;
pub use coalescent_hmm::CoalescentHmm;
pub use dual::Dual;
pub use engine::{CoreInput, InferenceCore, Posterior};
pub use error::{Error, Result};
pub use forward_backward::SPAN_CUTOFF;
pub use hidden_states::{balance_hidden_states, validate_hidden_states, T_MAX};
pub use matrix::DualMatrix;
pub use observation::{total_span, validate_observation, BlockKey, Observation, MISSING};
pub use params::{ParameterModel, Target, MAX_BLOCKS};
pub use rate::RateFunction;
pub use session::{InferenceSession, SessionOptions, SessionState};
pub use sfs::{sfs, MAX_SAMPLE_SIZE};
pub use thin::thin_data;
