//! Data-layer error carrier.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DataError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("layout error on {path}: {message}")]
    Layout { path: String, message: String },

    #[error("range error: {message}")]
    Range { message: String },

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("spec error: {0}")]
    Spec(#[from] tsiboard_dsl::DslError),
}

impl DataError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        DataError::Io { path: path.into(), source }
    }

    pub fn layout(path: impl Into<String>, message: impl Into<String>) -> Self {
        DataError::Layout { path: path.into(), message: message.into() }
    }

    pub fn range(message: impl Into<String>) -> Self {
        DataError::Range { message: message.into() }
    }
}

pub type DataResult<T> = Result<T, DataError>;
