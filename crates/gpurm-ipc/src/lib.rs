#![forbid(unsafe_code)]

//! Wire protocol and client transport for the GPU resource manager.
//!
//! Every call is one fixed-size [`Request`] answered by one fixed-size [`Response`]. There are no
//! variable-length payloads; anything that does not fit in the inline fields is truncated.

pub mod protocol;

#[cfg(unix)]
pub mod client;
#[cfg(unix)]
pub mod transport;

pub use protocol::{
    DecodeError, DisplayInfo, Opcode, PixelFormat, Request, Response, Status, SubmitFlags,
    DISPLAY_INFO_BYTES, MAX_INLINE_DWORDS, PROTOCOL_VERSION, REQUEST_SIZE, RESPONSE_SIZE,
};

#[cfg(unix)]
pub use client::{Allocation, ClientError, InitInfo, RmClient};
#[cfg(unix)]
pub use transport::{
    connect, ChannelKind, Connection, ConnectionState, Endpoint, TransportError,
    DEFAULT_RENDEZVOUS_NAME, DEFAULT_SOCKET_PATH,
};
