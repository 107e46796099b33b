//! JKSPEC: the declarative training specification language.
//!
//! `decode` runs tokenize → parse → validate → materialize and returns the
//! table-of-tables model. Every failure is fatal with the offending
//! location or row; nothing defaults silently.

mod lexer;
mod materialize;
mod parser;
pub mod tables;
mod validate;

pub use tables::{JkSpecs, Row, Table, ROW_ID};

use crate::error::DslResult;

pub fn decode(text: &str) -> DslResult<JkSpecs> {
    let doc = parser::Parser::new(text).parse()?;
    validate::validate_document(&doc)?;
    materialize::materialize_document(&doc)
}
