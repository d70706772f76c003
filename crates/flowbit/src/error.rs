use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid step type: {0}")]
    InvalidStep(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Step error: {0}")]
    Step(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Evaluation error: {0}")]
    Evaluation(String),

    #[error("JSON serialization/deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Programmer errors that composites must never convert into a failed
    /// step output.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::InvalidStep(_) | Error::Config(_))
    }
}
