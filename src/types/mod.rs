//! Shared value types and the error taxonomy

pub mod error;
pub mod ids;
pub mod term;

pub use error::{ClientError, Result};
pub use ids::{ImageFingerprint, InferenceId, RequestId, SessionIdentity, WorkerId};
pub use term::{Term, Variable};
