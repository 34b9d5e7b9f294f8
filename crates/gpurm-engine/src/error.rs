use gpurm_ring::RingError;
use thiserror::Error;

use crate::{Token, MAX_ENGINES};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("engine pool is empty")]
    NoEngine,

    #[error("timed out")]
    Timeout,

    #[error("invalid engine token {0:#x}")]
    InvalidToken(Token),

    #[error("engine {0:#x} is not held by the caller")]
    NotHeld(Token),

    #[error("fence {fence} was never submitted on engine {token:#x} (last submitted {submitted})")]
    BadFence {
        token: Token,
        fence: u64,
        submitted: u64,
    },

    #[error("too many engines ({count} > {})", MAX_ENGINES)]
    TooManyEngines { count: usize },

    #[error(transparent)]
    Ring(#[from] RingError),
}
