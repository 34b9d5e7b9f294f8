#![forbid(unsafe_code)]

//! The resource manager daemon: request dispatch, display state, GPU aperture accounting and the
//! listeners that feed them.

pub mod aperture;
pub mod config;
pub mod dispatch;
pub mod display;
mod error;
pub mod metrics;
#[cfg(unix)]
pub mod server;
pub mod session;

pub use aperture::{Aperture, ApertureError, APERTURE_ALIGN};
pub use config::{ConfigError, ServerConfig};
pub use dispatch::{Dispatcher, MemoryObject, SERVER_HANDLE_BASE};
pub use display::{CrtcTiming, DisplayError, DisplayMode, DisplayState};
pub use error::ServerError;
pub use metrics::{Metrics, MetricsSnapshot};
#[cfg(unix)]
pub use server::{start_server, ServerHandle};
pub use session::Session;
