//! Memory-mapped observation pipeline.
//!
//! ```text
//! csv → packer → channel .bin files → ConcatDataset (mmap, key-indexed)
//!                                           ↓
//!                       ObservationPipeline ([C,T,D] + mask assembly)
//!                                           ↓
//!                       Dataloader ([B,C,T,D] batches, seq/random)
//! ```

pub mod dataset;
pub mod error;
pub mod mmap;
pub mod packer;
pub mod pipeline;
pub mod record;

pub use dataset::{ConcatDataset, SequenceBlock};
pub use error::{DataError, DataResult};
pub use pipeline::{Dataloader, ObservationBatch, ObservationPipeline, ObservationSample, SamplerMode};
pub use record::{BasicRecord, KlineRecord, Record};
