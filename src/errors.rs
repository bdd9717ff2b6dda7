use thiserror::Error;

/// The error taxonomy surfaced out of the simulation and optimisation calls.
///
/// All of these are fatal for the run that raised them: the engine never
/// retries internally and never substitutes defaults for structurally
/// required components.
#[derive(Debug, Error)]
pub enum MinigridError {
    #[error("Invalid input structure: {0}")]
    InputStructure(String),
    #[error("Unsupported mode requested: {0}")]
    UnsupportedMode(String),
    #[error("Internal consistency failure: {0}")]
    InternalConsistency(String),
    #[error(
        "Collector/tank solver failed to converge at hour {hour} after {iterations} iterations"
    )]
    NonConvergence { hour: usize, iterations: usize },
    #[error("Resource profile unavailable: {0}")]
    ResourceProfileUnavailable(String),
}

impl MinigridError {
    pub(crate) fn input_structure(message: impl Into<String>) -> Self {
        Self::InputStructure(message.into())
    }

    pub(crate) fn unsupported_mode(message: impl Into<String>) -> Self {
        Self::UnsupportedMode(message.into())
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::InternalConsistency(message.into())
    }
}
