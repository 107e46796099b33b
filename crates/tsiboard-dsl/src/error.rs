//! Error carrier for every DSL decoder.
//!
//! Parse/schema/topology/compatibility/range errors are fatal at
//! construction time; decoders return them through `Result` and never build
//! a partial value. Line/column positions are attached where the lexer can
//! supply them.

use std::fmt;
use thiserror::Error;

/// Source position, 1-based. `0:0` means "not available".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Location {
    pub line: usize,
    pub col: usize,
}

impl Location {
    pub fn new(line: usize, col: usize) -> Self {
        Self { line, col }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

#[derive(Debug, Error)]
pub enum DslError {
    #[error("parse error at {location}: {message}")]
    Parse { location: Location, message: String },

    #[error("schema error: {message}")]
    Schema { message: String },

    #[error("topology error: {message}")]
    Topology { message: String },

    #[error("compatibility error: {message}")]
    Compatibility { message: String },

    #[error("range error: {message}")]
    Range { message: String },
}

impl DslError {
    pub fn parse(location: Location, message: impl Into<String>) -> Self {
        DslError::Parse { location, message: message.into() }
    }

    pub fn parse_nowhere(message: impl Into<String>) -> Self {
        DslError::Parse { location: Location::default(), message: message.into() }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        DslError::Schema { message: message.into() }
    }

    pub fn topology(message: impl Into<String>) -> Self {
        DslError::Topology { message: message.into() }
    }

    pub fn compatibility(message: impl Into<String>) -> Self {
        DslError::Compatibility { message: message.into() }
    }

    pub fn range(message: impl Into<String>) -> Self {
        DslError::Range { message: message.into() }
    }
}

pub type DslResult<T> = Result<T, DslError>;
