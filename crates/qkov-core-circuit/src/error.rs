use thiserror::Error;

use crate::config::BaselineMode;

#[derive(Debug, Error)]
pub enum CircuitError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("token id {token} out of range for vocabulary of {vocab}")]
    TokenOutOfRange { token: u32, vocab: usize },

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("dimension error: {0}")]
    Dimension(String),

    #[error("missing weight '{key}' ({role})")]
    MissingWeight { key: String, role: &'static str },

    #[error("no {mode} baseline computed for head {head}")]
    MissingBaseline { head: usize, mode: BaselineMode },

    #[error("top-k: k={k} exceeds score length {len}")]
    TopKOutOfRange { k: usize, len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("scan cancelled after {completed} of {total} tokens")]
    Cancelled { completed: usize, total: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("kernel error: {0}")]
    Kernel(String),
}

// anyhow::Error is not a std Error, so no #[from]
impl From<anyhow::Error> for CircuitError {
    fn from(e: anyhow::Error) -> Self {
        CircuitError::Kernel(format!("{e:#}"))
    }
}

pub type Result<T> = std::result::Result<T, CircuitError>;
