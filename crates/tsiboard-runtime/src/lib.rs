//! Runtime board: typed nodes, builder and cooperative executor.
//!
//! ```text
//! ContractRecord + WaveRecord + wave id
//!          ↓ build_board (validation, node construction, hop wiring)
//!        Board { contracts: [nodes + hops + seeds + DSL snapshot] }
//!          ↓ Executor (FIFO event loop, wave advancement, cancellation)
//!        ExecReport per contract
//! ```
//!
//! Boards exclusively own their contracts; contracts own their nodes and
//! hops; hops reference nodes by index. There is no shared mutable state
//! outside the [`context::RuntimeContext`] the caller threads through.

pub mod builder;
pub mod context;
pub mod error;
pub mod executor;
pub mod node;
pub mod nodes;

pub use builder::{build_board, Board, BoardContract, WiredHop};
pub use context::RuntimeContext;
pub use error::{RuntimeError, RuntimeResult};
pub use executor::{CancellationToken, ExecReport, Executor, StopReason};
pub use node::{Emitter, ExecContext, Ingress, Signal, StepOutcome, TsiNode, Wave, WaveCursor};
