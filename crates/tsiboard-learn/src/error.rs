//! Trainer-layer error carrier.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LearnError {
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("spec error: {0}")]
    Spec(#[from] tsiboard_dsl::DslError),

    #[error("config error: {message}")]
    Config { message: String },

    #[error("state error: {message}")]
    State { message: String },

    #[error("checkpoint error on {path}: {message}")]
    Checkpoint { path: String, message: String },
}

impl LearnError {
    pub fn config(message: impl Into<String>) -> Self {
        LearnError::Config { message: message.into() }
    }

    pub fn state(message: impl Into<String>) -> Self {
        LearnError::State { message: message.into() }
    }

    pub fn checkpoint(path: impl Into<String>, message: impl Into<String>) -> Self {
        LearnError::Checkpoint { path: path.into(), message: message.into() }
    }
}

pub type LearnResult<T> = Result<T, LearnError>;
