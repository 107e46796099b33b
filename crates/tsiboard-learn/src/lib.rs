//! VICReg-4D representation trainer.
//!
//! ```text
//! JkSpecs tables → TrainingSetup (optimizer/scheduler/loss builders)
//!        ↓                     ↓
//! VicregSpec (value) → instantiate → Vicreg4D (encoder + SWA + projector)
//!        ↑
//! Augmentation (two causal views per batch)
//! ```

pub mod augment;
pub mod encoder;
pub mod error;
pub mod loss;
pub mod optim;
pub mod projector;
pub mod sched;
pub mod setup;
pub mod swa;
pub mod vicreg;

pub use augment::{Augmentation, WarpCurve, WarpPreset};
pub use error::{LearnError, LearnResult};
pub use sched::SchedulerMode;
pub use setup::{SetupRegistry, TrainingSetup};
pub use vicreg::{StepStats, Vicreg4D, VicregSpec};
