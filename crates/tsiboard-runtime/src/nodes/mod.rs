//! Typed node implementations.

pub mod sink;
pub mod source;
pub mod vicreg;

pub use sink::{TsiSinkLogSys, TsiSinkNull};
pub use source::TsiSourceDataloader;
pub use vicreg::TsiVicreg;
