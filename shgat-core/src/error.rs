//! Error types for the SHGAT engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    #[error("Unknown member: {0}")]
    UnknownMember(String),

    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Empty input: {0}")]
    EmptyInput(String),

    #[error("Non-finite input: {0}")]
    NonFiniteInput(String),

    #[error("Hierarchy cycle through: {}", path.join(" -> "))]
    HierarchyCycle { path: Vec<String> },

    #[error("NaN gradient in {0}")]
    NaNGradient(String),

    #[error("Infinite gradient in {0}")]
    InfGradient(String),

    #[error("Parameter blob version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("Corrupt parameter blob: {0}")]
    CorruptBlob(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Training worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Check if the error indicates bad caller input rather than engine state
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::DuplicateId(_)
                | Error::UnknownMember(_)
                | Error::UnknownCapability(_)
                | Error::DimensionMismatch { .. }
                | Error::EmptyInput(_)
                | Error::NonFiniteInput(_)
        )
    }

    /// Check if the error aborted a training step with parameters untouched
    pub fn is_numerical(&self) -> bool {
        matches!(self, Error::NaNGradient(_) | Error::InfGradient(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_formats_path() {
        let err = Error::HierarchyCycle {
            path: vec!["cap_a".to_string(), "meta_ab".to_string(), "cap_a".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("cap_a -> meta_ab -> cap_a"));
    }

    #[test]
    fn test_error_classification() {
        assert!(Error::DuplicateId("t1".into()).is_validation());
        assert!(Error::NonFiniteInput("embedding".into()).is_validation());
        assert!(Error::NaNGradient("w_intent".into()).is_numerical());
        assert!(!Error::NaNGradient("w_intent".into()).is_validation());
    }
}
