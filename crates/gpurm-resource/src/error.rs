use thiserror::Error;

use crate::Handle;

pub type Result<T> = std::result::Result<T, ResourceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("resource {0:#x} not found")]
    NotFound(Handle),

    #[error("parent resource {0:#x} not found")]
    ParentNotFound(Handle),

    #[error("resource {0:#x} already exists")]
    AlreadyExists(Handle),
}
