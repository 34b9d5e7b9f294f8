#![forbid(unsafe_code)]

//! Userland GPU resource manager.
//!
//! The workspace is split by layer; this crate only re-exports them so that the end-to-end tests
//! under `tests/` can reach the whole stack through a single dependency.

pub use gpurm_engine as engine;
pub use gpurm_ipc as ipc;
pub use gpurm_resource as resource;
pub use gpurm_ring as ring;
pub use gpurm_server as server;
