//! Client side of the two local channels.
//!
//! The primary channel is an abstract-namespace Unix socket looked up by a rendezvous name. When
//! it is unavailable the client falls back to a Unix socket bound at a filesystem path. Both
//! carry the same frames, so the rest of the stack never cares which one is in use.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::protocol::{
    DecodeError, Opcode, Request, Response, Status, REQUEST_SIZE, RESPONSE_SIZE,
};

pub const DEFAULT_RENDEZVOUS_NAME: &str = "gpurm.rmapi";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/gpurm.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Rendezvous,
    Socket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected(ChannelKind),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no server found on either channel")]
    NotFound,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("connection is not established")]
    NotInitialized,

    #[error("short write ({written} of {expected} bytes)")]
    ShortWrite { written: usize, expected: usize },

    #[error("short read ({read} of {expected} bytes)")]
    ShortRead { read: usize, expected: usize },

    #[error("malformed frame: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// The status code a caller of the RMAPI-style surface sees for this failure.
    pub fn status(&self) -> Status {
        match self {
            TransportError::NotFound => Status::NotFound,
            TransportError::ConnectionRefused => Status::ConnectionRefused,
            TransportError::NotInitialized => Status::NotInitialized,
            _ => Status::IoError,
        }
    }

    fn from_connect(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => TransportError::NotFound,
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            _ => TransportError::Io(err),
        }
    }
}

/// Where to find the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Rendezvous name of the primary channel; `None` skips it.
    pub rendezvous: Option<String>,
    pub socket_path: PathBuf,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            rendezvous: Some(DEFAULT_RENDEZVOUS_NAME.to_string()),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
        }
    }
}

impl Endpoint {
    /// Reads `GPURM_RENDEZVOUS_NAME` and `GPURM_SOCKET_PATH`. An empty rendezvous name disables
    /// the primary channel.
    pub fn from_env() -> Self {
        let rendezvous = std::env::var("GPURM_RENDEZVOUS_NAME")
            .unwrap_or_else(|_| DEFAULT_RENDEZVOUS_NAME.into());
        let socket_path =
            std::env::var("GPURM_SOCKET_PATH").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.into());
        Self {
            rendezvous: (!rendezvous.trim().is_empty()).then(|| rendezvous.trim().to_string()),
            socket_path: PathBuf::from(socket_path),
        }
    }

    /// Fallback channel only.
    pub fn socket(path: impl Into<PathBuf>) -> Self {
        Self {
            rendezvous: None,
            socket_path: path.into(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_rendezvous(name: &str) -> io::Result<UnixStream> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixStream::connect_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_rendezvous(_name: &str) -> io::Result<UnixStream> {
    Err(io::Error::new(
        io::ErrorKind::NotFound,
        "abstract sockets are not supported on this platform",
    ))
}

fn connect_socket(path: &Path) -> io::Result<UnixStream> {
    UnixStream::connect(path)
}

/// Try the primary channel, then the fallback. The fallback's failure is the one reported.
pub fn connect(endpoint: &Endpoint) -> Result<Connection, TransportError> {
    if let Some(name) = &endpoint.rendezvous {
        match connect_rendezvous(name) {
            Ok(stream) => {
                tracing::debug!(name = %name, "connected over rendezvous channel");
                return Ok(Connection::new(stream, ChannelKind::Rendezvous));
            }
            Err(err) => {
                tracing::debug!(name = %name, "rendezvous channel unavailable: {err}");
            }
        }
    }

    let stream = connect_socket(&endpoint.socket_path).map_err(TransportError::from_connect)?;
    tracing::debug!(path = %endpoint.socket_path.display(), "connected over socket channel");
    Ok(Connection::new(stream, ChannelKind::Socket))
}

enum Link {
    Disconnected,
    Connected { kind: ChannelKind, stream: UnixStream },
}

/// A client connection.
///
/// One lock serializes every request/response pair, so at most one call is in flight on a
/// connection at a time. Any transport failure drops the link; there is no reconnect.
pub struct Connection {
    link: Mutex<Link>,
}

impl Connection {
    fn new(stream: UnixStream, kind: ChannelKind) -> Self {
        Self {
            link: Mutex::new(Link::Connected { kind, stream }),
        }
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.link() {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connected { kind, .. } => ConnectionState::Connected(*kind),
        }
    }

    /// Send `req` and block for its response.
    pub fn request(&self, req: &Request) -> Result<Response, TransportError> {
        let mut link = self.link();
        let result = match &mut *link {
            Link::Disconnected => return Err(TransportError::NotInitialized),
            Link::Connected { stream, .. } => round_trip(stream, req),
        };
        if let Err(err) = &result {
            tracing::warn!(opcode = req.opcode, "transport failure, dropping connection: {err}");
            *link = Link::Disconnected;
        }
        result
    }

    /// Tell the server this client is done, then close the channel.
    pub fn shutdown(&self) -> Result<(), TransportError> {
        let mut link = self.link();
        let result = match &mut *link {
            Link::Disconnected => return Ok(()),
            Link::Connected { stream, .. } => {
                round_trip(stream, &Request::new(Opcode::Shutdown)).map(|_| ())
            }
        };
        if let Link::Connected { stream, .. } = &*link {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        *link = Link::Disconnected;
        result
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .finish()
    }
}

fn round_trip(stream: &mut UnixStream, req: &Request) -> Result<Response, TransportError> {
    write_frame(stream, &req.encode())?;
    match read_frame::<RESPONSE_SIZE>(stream)? {
        Some(bytes) => Ok(Response::decode(&bytes)?),
        None => Err(TransportError::ShortRead {
            read: 0,
            expected: RESPONSE_SIZE,
        }),
    }
}

/// Write one whole frame. Anything less is a [`TransportError::ShortWrite`].
pub fn write_frame(w: &mut impl Write, frame: &[u8]) -> Result<(), TransportError> {
    let mut written = 0;
    while written < frame.len() {
        match w.write(&frame[written..]) {
            Ok(0) => {
                return Err(TransportError::ShortWrite {
                    written,
                    expected: frame.len(),
                })
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if written > 0 => {
                tracing::debug!("write failed mid-frame: {err}");
                return Err(TransportError::ShortWrite {
                    written,
                    expected: frame.len(),
                });
            }
            Err(err) => return Err(err.into()),
        }
    }
    w.flush()?;
    Ok(())
}

/// Read one whole frame of `N` bytes.
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before sending anything; a frame
/// cut off part way is a [`TransportError::ShortRead`].
pub fn read_frame<const N: usize>(r: &mut impl Read) -> Result<Option<[u8; N]>, TransportError> {
    let mut buf = [0u8; N];
    let mut read = 0;
    while read < N {
        match r.read(&mut buf[read..]) {
            Ok(0) if read == 0 => return Ok(None),
            Ok(0) => return Err(TransportError::ShortRead { read, expected: N }),
            Ok(n) => read += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(Some(buf))
}

/// Server-side helper: read one request frame.
pub fn read_request(r: &mut impl Read) -> Result<Option<Request>, TransportError> {
    match read_frame::<REQUEST_SIZE>(r)? {
        Some(bytes) => Ok(Some(Request::decode(&bytes)?)),
        None => Ok(None),
    }
}

/// Server-side helper: write one response frame.
pub fn write_response(w: &mut impl Write, resp: &Response) -> Result<(), TransportError> {
    write_frame(w, &resp.encode())
}
