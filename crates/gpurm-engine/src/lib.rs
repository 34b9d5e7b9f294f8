#![forbid(unsafe_code)]

//! Engine arbitration and fence tracking.
//!
//! An [`EngineManager`] owns a fixed pool of engine slots. Callers acquire a slot, submit command
//! words into its ring, and wait for fences that an [`ExecutionBackend`] reports as completed.

mod backend;
mod error;
mod manager;

pub use backend::{Completion, EngineInfo, ExecutionBackend, ManualBackend, SimulatedBackend};
pub use error::{EngineError, Result};
pub use manager::{
    EngineConfig, EngineKind, EngineManager, EngineSpec, EngineStatus, OwnerId, Token,
    DEFAULT_POLL_INTERVAL, MAX_ENGINES, TOKEN_BASE,
};
