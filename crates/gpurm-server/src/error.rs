use std::io;
use std::path::PathBuf;

use gpurm_engine::EngineError;
use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("another server is already listening on {}", .0.display())]
    SocketInUse(PathBuf),

    #[error("{} exists and is not a socket", .0.display())]
    NotASocket(PathBuf),
}
