//! Opcode routing.
//!
//! [`Dispatcher::dispatch`] runs exactly one handler per request and turns its outcome into the
//! response frame. Handlers return `Err(Status)` for every failure; nothing is retried here.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use gpurm_engine::{EngineError, EngineManager, ExecutionBackend, Token};
use gpurm_ipc::{
    Opcode, Request, Response, Status, SubmitFlags, MAX_INLINE_DWORDS, PROTOCOL_VERSION,
};
use gpurm_resource::{Handle, ResourceError, ResourceTable};

use crate::aperture::{Aperture, ApertureError};
use crate::config::{ServerConfig, APERTURE_BASE};
use crate::display::DisplayState;
use crate::metrics::Metrics;
use crate::session::Session;
use crate::ServerError;

/// First handle handed out when the client lets the server choose.
pub const SERVER_HANDLE_BASE: Handle = 0x8000_0000;

/// Payload of every resource created through `AllocateMemory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryObject {
    pub size: u64,
    pub gpu_addr: u64,
}

type HandlerResult = Result<Response, Status>;

fn engine_status(err: &EngineError) -> Status {
    match err {
        EngineError::NoEngine | EngineError::Timeout => Status::WouldBlock,
        EngineError::InvalidToken(_) => Status::NotFound,
        EngineError::NotHeld(_)
        | EngineError::BadFence { .. }
        | EngineError::TooManyEngines { .. }
        | EngineError::Ring(_) => Status::BadValue,
    }
}

fn resource_status(err: &ResourceError) -> Status {
    match err {
        ResourceError::NotFound(_) | ResourceError::ParentNotFound(_) => Status::NotFound,
        ResourceError::AlreadyExists(_) => Status::BadValue,
    }
}

fn aperture_status(err: &ApertureError) -> Status {
    match err {
        ApertureError::ZeroSize => Status::BadValue,
        ApertureError::OutOfMemory { .. } => Status::WouldBlock,
    }
}

pub struct Dispatcher {
    resources: ResourceTable<MemoryObject>,
    engines: EngineManager,
    display: Mutex<DisplayState>,
    aperture: Mutex<Aperture>,
    next_handle: AtomicU64,
    metrics: Metrics,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, backend: Arc<dyn ExecutionBackend>) -> Result<Self, ServerError> {
        let engines = EngineManager::new(config.engine_config()?, backend)?;
        Ok(Self::from_parts(
            engines,
            DisplayState::new(config.display_heads),
            Aperture::new(APERTURE_BASE, config.aperture_size),
        ))
    }

    pub fn from_parts(engines: EngineManager, display: DisplayState, aperture: Aperture) -> Self {
        Self {
            resources: ResourceTable::new(),
            engines,
            display: Mutex::new(display),
            aperture: Mutex::new(aperture),
            next_handle: AtomicU64::new(SERVER_HANDLE_BASE),
            metrics: Metrics::new(),
        }
    }

    pub fn resources(&self) -> &ResourceTable<MemoryObject> {
        &self.resources
    }

    pub fn engines(&self) -> &EngineManager {
        &self.engines
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn aperture_used(&self) -> u64 {
        self.aperture().used()
    }

    fn display(&self) -> MutexGuard<'_, DisplayState> {
        self.display.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn aperture(&self) -> MutexGuard<'_, Aperture> {
        self.aperture.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dispatch(&self, session: &mut Session, req: &Request) -> Response {
        let session_id = session.id();
        let resp = match req.opcode() {
            None => {
                tracing::warn!(session_id, opcode = req.opcode, "rejecting unknown opcode");
                self.metrics.protocol_error();
                Response::from_status(Status::BadValue)
            }
            Some(opcode) if opcode != Opcode::Init && !session.is_initialized() => {
                tracing::debug!(session_id, ?opcode, "request before init");
                Response::from_status(Status::NotInitialized)
            }
            Some(opcode) => {
                let resp = self
                    .handle(session, opcode, req)
                    .unwrap_or_else(Response::from_status);
                tracing::debug!(session_id, ?opcode, status = ?resp.status, "request handled");
                resp
            }
        };
        self.metrics.request(resp.status.is_ok());
        resp
    }

    fn handle(&self, session: &mut Session, opcode: Opcode, req: &Request) -> HandlerResult {
        match opcode {
            Opcode::Init => self.init(session, req),
            Opcode::Shutdown => {
                self.end_session(session);
                Ok(Response::ok(0, 0))
            }
            Opcode::GetDisplayInfo => self.get_display_info(req),
            Opcode::SetDisplayMode => self.set_display_mode(req),
            Opcode::AllocateMemory => self.allocate_memory(req),
            Opcode::FreeMemory => self.free_memory(req),
            Opcode::SubmitCommand => self.submit_command(session, req),
            Opcode::WaitFence => self.wait_fence(req),
        }
    }

    /// Release everything `session` still holds. Called on Shutdown and on disconnect.
    pub fn end_session(&self, session: &mut Session) {
        for token in session.take_engines() {
            match self.engines.release_owned(session.id(), token) {
                Ok(()) => {
                    tracing::debug!(session_id = session.id(), token, "released engine on session end")
                }
                Err(err) => {
                    tracing::warn!(session_id = session.id(), token, "engine release failed: {err}")
                }
            }
        }
        session.set_initialized(false);
    }

    fn init(&self, session: &mut Session, req: &Request) -> HandlerResult {
        if req.param1 > PROTOCOL_VERSION {
            tracing::warn!(
                session_id = session.id(),
                client_version = req.param1,
                "client speaks a newer protocol"
            );
            return Err(Status::BadValue);
        }
        session.set_initialized(true);
        let heads = self.display().head_count() as u64;
        Ok(Response::ok(
            PROTOCOL_VERSION,
            self.engines.len() as u64 | (heads << 32),
        ))
    }

    fn get_display_info(&self, req: &Request) -> HandlerResult {
        let head = u32::try_from(req.param1).map_err(|_| Status::BadValue)?;
        let info = self
            .display()
            .mode(head)
            .map_err(|_| Status::BadValue)?
            .info();
        let (result1, result2, copied) = info.pack(req.param2);
        Ok(Response::ok(result1, result2).with_flags(copied as u32))
    }

    fn set_display_mode(&self, req: &Request) -> HandlerResult {
        let head = u32::try_from(req.param1).map_err(|_| Status::BadValue)?;
        self.display()
            .set_mode(
                head,
                req.param2 as u32,
                (req.param2 >> 32) as u32,
                req.param3 as u32,
                (req.param3 >> 32) as u32,
            )
            .map_err(|err| {
                tracing::debug!(head, "set mode rejected: {err}");
                Status::BadValue
            })?;
        Ok(Response::ok(0, 0))
    }

    fn allocate_memory(&self, req: &Request) -> HandlerResult {
        let size = req.param1;
        let parent = (req.param2 != 0).then_some(req.param2);
        let requested = (req.param3 != 0).then_some(req.param3);

        // Held across the table insert so a failed create can hand the range straight back.
        let mut aperture = self.aperture();
        let gpu_addr = aperture.alloc(size).map_err(|err| {
            tracing::debug!(size, "aperture allocation failed: {err}");
            aperture_status(&err)
        })?;
        let object = MemoryObject { size, gpu_addr };

        let created = match requested {
            Some(handle) => self.resources.create(handle, parent, object),
            None => loop {
                let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
                match self.resources.create(handle, parent, object) {
                    Err(ResourceError::AlreadyExists(_)) => continue,
                    other => break other,
                }
            },
        };

        match created {
            Ok(node) => {
                tracing::debug!(handle = node.handle(), ?parent, size, gpu_addr, "memory allocated");
                Ok(Response::ok(node.handle(), gpu_addr))
            }
            Err(err) => {
                aperture.free(gpu_addr, size);
                tracing::debug!(?requested, ?parent, "allocation rejected: {err}");
                Err(resource_status(&err))
            }
        }
    }

    fn free_memory(&self, req: &Request) -> HandlerResult {
        let handle = req.param1;
        let removed = self.resources.destroy(handle).map_err(|err| resource_status(&err))?;

        let mut aperture = self.aperture();
        for node in &removed {
            let object = node.payload();
            aperture.free(object.gpu_addr, object.size);
        }
        tracing::debug!(handle, removed = removed.len(), "memory freed");
        Ok(Response::ok(removed.len() as u64, 0))
    }

    fn check_held(&self, session: &Session, token: Token) -> Result<(), Status> {
        if session.holds(token) {
            return Ok(());
        }
        match self.engines.status(token) {
            Err(err) => Err(engine_status(&err)),
            Ok(_) => Err(Status::BadValue),
        }
    }

    fn submit_command(&self, session: &mut Session, req: &Request) -> HandlerResult {
        let flags = SubmitFlags::from_bits_retain(req.flags);
        let acquire = flags.contains(SubmitFlags::ACQUIRE);
        let release = flags.contains(SubmitFlags::RELEASE);

        match (acquire, release) {
            (true, true) => Err(Status::BadValue),
            (true, false) => {
                let timeout = Duration::from_millis(req.param2);
                let token = self
                    .engines
                    .acquire(session.id(), req.param1, timeout)
                    .map_err(|err| engine_status(&err))?;
                session.hold(token);
                Ok(Response::ok(token, 0))
            }
            (false, true) => {
                let token = req.param1;
                self.check_held(session, token)?;
                self.engines
                    .release_owned(session.id(), token)
                    .map_err(|err| engine_status(&err))?;
                session.drop_engine(token);
                Ok(Response::ok(0, 0))
            }
            (false, false) => {
                let count = flags.dword_count();
                if count == 0 || count > MAX_INLINE_DWORDS {
                    return Err(Status::BadValue);
                }
                let token = req.param1;
                self.check_held(session, token)?;

                let inline = [
                    req.param2 as u32,
                    (req.param2 >> 32) as u32,
                    req.param3 as u32,
                    (req.param3 >> 32) as u32,
                ];
                let fence = self
                    .engines
                    .submit_work(token, &inline[..count])
                    .map_err(|err| engine_status(&err))?;
                self.metrics.fence_submitted();
                Ok(Response::ok(fence, 0))
            }
        }
    }

    fn wait_fence(&self, req: &Request) -> HandlerResult {
        let (token, fence) = (req.param1, req.param2);
        self.engines
            .wait_fence(token, fence, Duration::from_millis(req.param3))
            .map_err(|err| engine_status(&err))?;
        let completed = self
            .engines
            .completed_fence(token)
            .map_err(|err| engine_status(&err))?;
        Ok(Response::ok(completed, 0))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resources", &self.resources.len())
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}
