#![forbid(unsafe_code)]

//! Handle-indexed resource ownership trees.

mod error;
mod table;

pub use error::{ResourceError, Result};
pub use table::{Handle, Resource, ResourceTable};
