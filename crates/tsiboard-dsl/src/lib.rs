//! DSL layer: canonical paths, JKSPEC, circuits, waves, observation specs
//! and the content-addressed contract registry.
//!
//! ## Pipeline
//!
//! ```text
//! texts → decode (per DSL) → validated models → ContractRegistry (frozen)
//!                                       ↓
//!                       board builder (tsiboard-runtime)
//! ```
//!
//! Decoders are pure except for the hash-name registry, which allocates
//! stable mnemonic names for `default` hashimyei tags and is threaded in
//! explicitly by the caller.

pub mod canonical_path;
pub mod circuit;
pub mod compat;
pub mod contract;
pub mod error;
pub mod jkspec;
pub mod observation;
pub mod wave;

pub use canonical_path::{CanonicalPath, HashNameRegistry};
pub use contract::{ContractRecord, ContractRegistry, WaveRecord};
pub use error::{DslError, DslResult};
pub use jkspec::JkSpecs;
