//! Runtime-layer error carrier.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("dsl error: {0}")]
    Dsl(#[from] tsiboard_dsl::DslError),

    #[error("data error: {0}")]
    Data(#[from] tsiboard_data::DataError),

    #[error("learn error: {0}")]
    Learn(#[from] tsiboard_learn::LearnError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("build error: {message}")]
    Build { message: String },

    #[error("execution error at node '{node}': {message}")]
    Exec { node: String, message: String },
}

impl RuntimeError {
    pub fn build(message: impl Into<String>) -> Self {
        RuntimeError::Build { message: message.into() }
    }

    pub fn exec(node: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Exec { node: node.into(), message: message.into() }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
