//! Typed RMAPI-style wrappers over a [`Connection`].

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{
    DisplayInfo, Opcode, PixelFormat, Request, Response, Status, SubmitFlags, MAX_INLINE_DWORDS,
    PROTOCOL_VERSION,
};
use crate::transport::{self, Connection, Endpoint, TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{opcode:?} failed: {status}")]
    Status { opcode: Opcode, status: Status },

    #[error("at most {} inline dwords per submission, got {0}", MAX_INLINE_DWORDS)]
    TooManyDwords(usize),
}

impl ClientError {
    pub fn status(&self) -> Status {
        match self {
            ClientError::Transport(err) => err.status(),
            ClientError::Status { status, .. } => *status,
            ClientError::TooManyDwords(_) => Status::BadValue,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitInfo {
    pub protocol_version: u64,
    pub engines: u32,
    pub display_heads: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub handle: u64,
    pub gpu_addr: u64,
}

/// Thin client stub. Every method is exactly one request/response round trip.
#[derive(Debug)]
pub struct RmClient {
    conn: Connection,
}

impl RmClient {
    pub fn connect(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            conn: transport::connect(endpoint)?,
        })
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn call(&self, req: Request) -> Result<Response> {
        let resp = self.conn.request(&req)?;
        if resp.status.is_ok() {
            return Ok(resp);
        }
        let opcode = req.opcode().unwrap_or(Opcode::Init);
        Err(ClientError::Status {
            opcode,
            status: resp.status,
        })
    }

    pub fn init(&self) -> Result<InitInfo> {
        let resp = self.call(Request::new(Opcode::Init).with_params(PROTOCOL_VERSION, 0, 0))?;
        Ok(InitInfo {
            protocol_version: resp.result1,
            engines: resp.result2 as u32,
            display_heads: (resp.result2 >> 32) as u32,
        })
    }

    /// Fetch display information, keeping at most `size` bytes of it (0 for all of it).
    ///
    /// Returns the view and how many bytes the server actually filled in.
    pub fn get_display_info(&self, head: u32, size: usize) -> Result<(DisplayInfo, usize)> {
        let resp = self.call(
            Request::new(Opcode::GetDisplayInfo).with_params(head as u64, size as u64, 0),
        )?;
        Ok((
            DisplayInfo::unpack(resp.result1, resp.result2),
            resp.flags as usize,
        ))
    }

    pub fn set_display_mode(
        &self,
        head: u32,
        width: u32,
        height: u32,
        refresh: u32,
        format: PixelFormat,
    ) -> Result<()> {
        self.call(Request::new(Opcode::SetDisplayMode).with_params(
            head as u64,
            (width as u64) | ((height as u64) << 32),
            (refresh as u64) | ((format.to_u32() as u64) << 32),
        ))?;
        Ok(())
    }

    /// Allocate GPU memory. `handle` of `None` lets the server pick one.
    pub fn allocate_memory(
        &self,
        size: u64,
        parent: Option<u64>,
        handle: Option<u64>,
    ) -> Result<Allocation> {
        let resp = self.call(Request::new(Opcode::AllocateMemory).with_params(
            size,
            parent.unwrap_or(0),
            handle.unwrap_or(0),
        ))?;
        Ok(Allocation {
            handle: resp.result1,
            gpu_addr: resp.result2,
        })
    }

    /// Free `handle` and everything allocated under it.
    pub fn free_memory(&self, handle: u64) -> Result<()> {
        self.call(Request::new(Opcode::FreeMemory).with_params(handle, 0, 0))?;
        Ok(())
    }

    pub fn acquire_engine(&self, capabilities: u64, timeout: Duration) -> Result<u64> {
        let resp = self.call(
            Request::new(Opcode::SubmitCommand)
                .with_flags(SubmitFlags::ACQUIRE.bits())
                .with_params(capabilities, duration_ms(timeout), 0),
        )?;
        Ok(resp.result1)
    }

    pub fn release_engine(&self, token: u64) -> Result<()> {
        self.call(
            Request::new(Opcode::SubmitCommand)
                .with_flags(SubmitFlags::RELEASE.bits())
                .with_params(token, 0, 0),
        )?;
        Ok(())
    }

    /// Submit up to [`MAX_INLINE_DWORDS`] command dwords; returns the fence for them.
    pub fn submit(&self, token: u64, dwords: &[u32]) -> Result<u64> {
        if dwords.len() > MAX_INLINE_DWORDS {
            return Err(ClientError::TooManyDwords(dwords.len()));
        }
        let mut inline = [0u32; MAX_INLINE_DWORDS];
        inline[..dwords.len()].copy_from_slice(dwords);
        let resp = self.call(
            Request::new(Opcode::SubmitCommand)
                .with_flags(SubmitFlags::with_dword_count(dwords.len()).bits())
                .with_params(
                    token,
                    (inline[0] as u64) | ((inline[1] as u64) << 32),
                    (inline[2] as u64) | ((inline[3] as u64) << 32),
                ),
        )?;
        Ok(resp.result1)
    }

    /// Wait for `fence` on `token`; returns the engine's completed fence.
    pub fn wait_fence(&self, token: u64, fence: u64, timeout: Duration) -> Result<u64> {
        let resp = self.call(Request::new(Opcode::WaitFence).with_params(
            token,
            fence,
            duration_ms(timeout),
        ))?;
        Ok(resp.result1)
    }

    pub fn shutdown(&self) -> Result<()> {
        self.conn.shutdown()?;
        Ok(())
    }
}

fn duration_ms(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}
