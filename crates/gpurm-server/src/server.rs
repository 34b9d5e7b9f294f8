//! Listeners and per-client session threads.
//!
//! The server accepts on up to two channels: the abstract rendezvous name (Linux only) and the
//! filesystem socket. Every accepted connection gets its own thread that reads one request
//! frame, dispatches it and writes exactly one response frame, until the peer disconnects or
//! sends `Shutdown`.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gpurm_ipc::transport::{read_request, write_response};
use gpurm_ipc::{ChannelKind, Opcode};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::session::Session;
use crate::ServerError;

struct Shared {
    dispatcher: Arc<Dispatcher>,
    stop: AtomicBool,
    poll_interval: Duration,
    // Clones of live session streams, so shutdown can unblock their readers.
    streams: Mutex<HashMap<u64, UnixStream>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn streams(&self) -> MutexGuard<'_, HashMap<u64, UnixStream>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct ServerHandle {
    socket_path: PathBuf,
    rendezvous_name: Option<String>,
    shared: Arc<Shared>,
    acceptors: Vec<JoinHandle<()>>,
    socket_bound: bool,
}

impl ServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The abstract name actually bound, if the primary channel is up.
    pub fn rendezvous_name(&self) -> Option<&str> {
        self.rendezvous_name.as_deref()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.shared.dispatcher
    }

    /// Stop accepting, disconnect every client and wait for their sessions to be torn down.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for acceptor in self.acceptors.drain(..) {
            if acceptor.join().is_err() {
                tracing::error!("accept thread panicked");
            }
        }

        for stream in self.shared.streams().values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let sessions = std::mem::take(&mut *self.shared.sessions());
        for session in sessions {
            if session.join().is_err() {
                tracing::error!("session thread panicked");
            }
        }

        if self.socket_bound {
            self.socket_bound = false;
            if let Err(err) = fs::remove_file(&self.socket_path) {
                if err.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.socket_path.display(), "failed to remove socket: {err}");
                }
            }
            tracing::info!("server stopped");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("socket_path", &self.socket_path)
            .field("rendezvous_name", &self.rendezvous_name)
            .finish_non_exhaustive()
    }
}

/// Bind both channels and start accepting.
///
/// The fallback socket must come up; the rendezvous name is best-effort. A leftover socket file
/// nobody is listening on is replaced, while a live one is reported as [`ServerError::SocketInUse`].
pub fn start_server(
    config: &ServerConfig,
    dispatcher: Arc<Dispatcher>,
) -> Result<ServerHandle, ServerError> {
    let socket = bind_socket(&config.socket_path)?;
    socket.set_nonblocking(true)?;

    let rendezvous = match &config.rendezvous_name {
        Some(name) => match bind_rendezvous(name) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                Some((name.clone(), listener))
            }
            Err(err) => {
                tracing::warn!(name, "rendezvous channel unavailable, serving fallback only: {err}");
                None
            }
        },
        None => None,
    };

    let shared = Arc::new(Shared {
        dispatcher,
        stop: AtomicBool::new(false),
        poll_interval: config.poll_interval,
        streams: Mutex::new(HashMap::new()),
        sessions: Mutex::new(Vec::new()),
    });

    let mut handle = ServerHandle {
        socket_path: config.socket_path.clone(),
        rendezvous_name: None,
        shared: shared.clone(),
        acceptors: Vec::new(),
        socket_bound: true,
    };

    let mut listeners = vec![(ChannelKind::Socket, socket)];
    if let Some((name, listener)) = rendezvous {
        handle.rendezvous_name = Some(name);
        listeners.push((ChannelKind::Rendezvous, listener));
    }
    for (kind, listener) in listeners {
        let shared = shared.clone();
        let acceptor = thread::Builder::new()
            .name(format!("gpurm-accept-{kind:?}").to_lowercase())
            .spawn(move || accept_loop(&shared, kind, listener))?;
        handle.acceptors.push(acceptor);
    }

    tracing::info!(
        socket = %handle.socket_path.display(),
        rendezvous = ?handle.rendezvous_name,
        "server listening"
    );
    Ok(handle)
}

fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(ServerError::NotASocket(path.to_path_buf()));
            }
            if UnixStream::connect(path).is_ok() {
                return Err(ServerError::SocketInUse(path.to_path_buf()));
            }
            tracing::info!(path = %path.display(), "removing stale socket");
            fs::remove_file(path)?;
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    Ok(UnixListener::bind(path)?)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_rendezvous(name: &str) -> io::Result<UnixListener> {
    #[cfg(target_os = "android")]
    use std::os::android::net::SocketAddrExt;
    #[cfg(target_os = "linux")]
    use std::os::linux::net::SocketAddrExt;

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
    UnixListener::bind_addr(&addr)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_rendezvous(_name: &str) -> io::Result<UnixListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "abstract sockets are not supported on this platform",
    ))
}

fn accept_loop(shared: &Arc<Shared>, kind: ChannelKind, listener: UnixListener) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = spawn_session(shared, kind, stream) {
                    tracing::error!(?kind, "failed to start session: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(shared.poll_interval);
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                tracing::warn!(?kind, "accept failed: {err}");
                thread::sleep(shared.poll_interval);
            }
        }
    }
}

fn spawn_session(shared: &Arc<Shared>, kind: ChannelKind, stream: UnixStream) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    let id = shared.dispatcher.metrics().next_session_id();
    shared.streams().insert(id, stream.try_clone()?);

    let worker = {
        let shared = shared.clone();
        thread::Builder::new()
            .name(format!("gpurm-session-{id}"))
            .spawn(move || {
                let span = tracing::info_span!("session", session_id = id, channel = ?kind);
                let _entered = span.enter();
                serve_session(&shared, id, stream);
            })
    };
    match worker {
        Ok(worker) => {
            let mut sessions = shared.sessions();
            sessions.retain(|session| !session.is_finished());
            sessions.push(worker);
            Ok(())
        }
        Err(err) => {
            shared.streams().remove(&id);
            Err(err)
        }
    }
}

fn serve_session(shared: &Shared, id: u64, mut stream: UnixStream) {
    let dispatcher = &shared.dispatcher;
    let metrics = dispatcher.metrics();
    metrics.session_opened();
    tracing::info!("client connected");

    let mut session = Session::new(id);
    loop {
        let req = match read_request(&mut stream) {
            Ok(Some(req)) => req,
            Ok(None) => {
                tracing::debug!("client closed connection");
                break;
            }
            Err(err) => {
                tracing::debug!("read failed: {err}");
                break;
            }
        };

        let resp = dispatcher.dispatch(&mut session, &req);
        if let Err(err) = write_response(&mut stream, &resp) {
            tracing::debug!("write failed: {err}");
            break;
        }
        if req.opcode() == Some(Opcode::Shutdown) {
            break;
        }
    }

    dispatcher.end_session(&mut session);
    shared.streams().remove(&id);
    metrics.session_closed();
    tracing::info!("client disconnected");
}
