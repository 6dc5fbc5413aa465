use thiserror::Error;

use crate::Digest;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MixerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unknown commitment: {0}")]
    UnknownCommitment(Digest),

    #[error("deposit {0} is not yet confirmed")]
    NotYetConfirmed(Digest),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },

    #[error("submission failed: {0}")]
    SubmissionFailed(String),

    #[error("no confirmation within {waited_ms}ms")]
    ConfirmationTimeout { waited_ms: u64 },

    /// A deposit or withdrawal submission for this digest has not settled yet.
    #[error("submission for {0} is already in flight")]
    InFlight(Digest),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine stopped")]
    EngineStopped,
}

pub type Result<T> = std::result::Result<T, MixerError>;
