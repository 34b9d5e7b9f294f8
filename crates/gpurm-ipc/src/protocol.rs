//! Binary request/response frames.
//!
//! Both frames are fixed-size and little-endian:
//!
//! ```text
//! request  (32 bytes): opcode:u32 flags:u32 param1:u64 param2:u64 param3:u64
//! response (24 bytes): status:i32 flags:u32 result1:u64 result2:u64
//! ```
//!
//! Requests keep their opcode as a raw `u32` so an unknown opcode still decodes and can be
//! answered with [`Status::BadValue`] instead of tearing down the connection.

use core::fmt;

use bitflags::bitflags;

pub const PROTOCOL_VERSION: u64 = 1;

pub const REQUEST_SIZE: usize = 32;
pub const RESPONSE_SIZE: usize = 24;

/// Command dwords that fit inline in a `SubmitCommand` request (param2 and param3).
pub const MAX_INLINE_DWORDS: usize = 4;

/// Size of the display description that fits in `result1`/`result2`.
pub const DISPLAY_INFO_BYTES: usize = 16;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Opcode {
    Init = 1,
    Shutdown = 2,
    GetDisplayInfo = 3,
    SetDisplayMode = 4,
    AllocateMemory = 5,
    FreeMemory = 6,
    SubmitCommand = 7,
    WaitFence = 8,
}

impl Opcode {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => Opcode::Init,
            2 => Opcode::Shutdown,
            3 => Opcode::GetDisplayInfo,
            4 => Opcode::SetDisplayMode,
            5 => Opcode::AllocateMemory,
            6 => Opcode::FreeMemory,
            7 => Opcode::SubmitCommand,
            8 => Opcode::WaitFence,
            _ => return None,
        })
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }
}

/// Status codes surfaced to callers. Zero is success, everything else is negative.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 0,
    NotFound = -1,
    WouldBlock = -2,
    IoError = -3,
    ConnectionRefused = -4,
    NotInitialized = -5,
    BadValue = -6,
}

impl Status {
    pub fn from_i32(v: i32) -> Option<Self> {
        Some(match v {
            0 => Status::Ok,
            -1 => Status::NotFound,
            -2 => Status::WouldBlock,
            -3 => Status::IoError,
            -4 => Status::ConnectionRefused,
            -5 => Status::NotInitialized,
            -6 => Status::BadValue,
            _ => return None,
        })
    }

    pub fn to_i32(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::NotFound => "not found",
            Status::WouldBlock => "would block",
            Status::IoError => "I/O error",
            Status::ConnectionRefused => "connection refused",
            Status::NotInitialized => "not initialized",
            Status::BadValue => "bad value",
        };
        write!(f, "{name} ({})", self.to_i32())
    }
}

bitflags! {
    /// `SubmitCommand` request flags.
    ///
    /// With neither `ACQUIRE` nor `RELEASE` set the request is a submission, and bits 8..11
    /// carry the number of inline dwords.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct SubmitFlags: u32 {
        const ACQUIRE = 1 << 0;
        const RELEASE = 1 << 1;
        const DWORD_COUNT = 0xF << 8;
    }
}

impl SubmitFlags {
    const DWORD_COUNT_SHIFT: u32 = 8;

    pub fn with_dword_count(count: usize) -> Self {
        Self::from_bits_retain(((count as u32) << Self::DWORD_COUNT_SHIFT) & Self::DWORD_COUNT.bits())
    }

    pub fn dword_count(self) -> usize {
        ((self.bits() & Self::DWORD_COUNT.bits()) >> Self::DWORD_COUNT_SHIFT) as usize
    }
}

/// Pixel formats accepted by `SetDisplayMode`.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Argb8888 = 1,
    Xrgb8888 = 2,
    Rgb565 = 3,
}

impl PixelFormat {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            1 => PixelFormat::Argb8888,
            2 => PixelFormat::Xrgb8888,
            3 => PixelFormat::Rgb565,
            _ => return None,
        })
    }

    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Argb8888 | PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }
}

/// Inline view of one display head, as carried by a `GetDisplayInfo` response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayInfo {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    /// kHz.
    pub pixel_clock: u32,
}

impl DisplayInfo {
    pub fn to_bytes(&self) -> [u8; DISPLAY_INFO_BYTES] {
        let mut out = [0u8; DISPLAY_INFO_BYTES];
        out[0..4].copy_from_slice(&self.width.to_le_bytes());
        out[4..8].copy_from_slice(&self.height.to_le_bytes());
        out[8..12].copy_from_slice(&self.refresh.to_le_bytes());
        out[12..16].copy_from_slice(&self.pixel_clock.to_le_bytes());
        out
    }

    /// Pack into `(result1, result2)`, keeping only the first `requested` bytes.
    ///
    /// A request of 0 means "everything". Returns the packed results and the number of bytes
    /// actually kept.
    pub fn pack(&self, requested: u64) -> (u64, u64, usize) {
        let copied = match requested {
            0 => DISPLAY_INFO_BYTES,
            n => (n.min(DISPLAY_INFO_BYTES as u64)) as usize,
        };
        let mut bytes = self.to_bytes();
        bytes[copied..].fill(0);

        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&bytes[0..8]);
        hi.copy_from_slice(&bytes[8..16]);
        (u64::from_le_bytes(lo), u64::from_le_bytes(hi), copied)
    }

    pub fn unpack(result1: u64, result2: u64) -> Self {
        Self {
            width: result1 as u32,
            height: (result1 >> 32) as u32,
            refresh: result2 as u32,
            pixel_clock: (result2 >> 32) as u32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub opcode: u32,
    pub flags: u32,
    pub param1: u64,
    pub param2: u64,
    pub param3: u64,
}

impl Request {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode.to_u32(),
            flags: 0,
            param1: 0,
            param2: 0,
            param3: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_params(mut self, param1: u64, param2: u64, param3: u64) -> Self {
        self.param1 = param1;
        self.param2 = param2;
        self.param3 = param3;
        self
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u32(self.opcode)
    }

    pub fn encode(&self) -> [u8; REQUEST_SIZE] {
        let mut out = [0u8; REQUEST_SIZE];
        let mut w = Writer::new(&mut out);
        w.put_u32(self.opcode);
        w.put_u32(self.flags);
        w.put_u64(self.param1);
        w.put_u64(self.param2);
        w.put_u64(self.param3);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let req = Self {
            opcode: r.read_u32()?,
            flags: r.read_u32()?,
            param1: r.read_u64()?,
            param2: r.read_u64()?,
            param3: r.read_u64()?,
        };
        r.finish()?;
        Ok(req)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub flags: u32,
    pub result1: u64,
    pub result2: u64,
}

impl Response {
    pub fn ok(result1: u64, result2: u64) -> Self {
        Self {
            status: Status::Ok,
            flags: 0,
            result1,
            result2,
        }
    }

    pub fn from_status(status: Status) -> Self {
        Self {
            status,
            flags: 0,
            result1: 0,
            result2: 0,
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn encode(&self) -> [u8; RESPONSE_SIZE] {
        let mut out = [0u8; RESPONSE_SIZE];
        let mut w = Writer::new(&mut out);
        w.put_u32(self.status.to_i32() as u32);
        w.put_u32(self.flags);
        w.put_u64(self.result1);
        w.put_u64(self.result2);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let raw_status = r.read_u32()? as i32;
        let status = Status::from_i32(raw_status).ok_or(DecodeError::UnknownStatus(raw_status))?;
        let resp = Self {
            status,
            flags: r.read_u32()?,
            result1: r.read_u64()?,
            result2: r.read_u64()?,
        };
        r.finish()?;
        Ok(resp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnexpectedEof,
    TrailingBytes,
    UnknownStatus(i32),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnexpectedEof => write!(f, "unexpected EOF"),
            DecodeError::TrailingBytes => write!(f, "trailing bytes after frame"),
            DecodeError::UnknownStatus(status) => write!(f, "unknown status code {status}"),
        }
    }
}

impl std::error::Error for DecodeError {}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(out: &'a mut [u8]) -> Self {
        Self { out, pos: 0 }
    }

    fn put_u32(&mut self, v: u32) {
        self.out[self.pos..self.pos + 4].copy_from_slice(&v.to_le_bytes());
        self.pos += 4;
    }

    fn put_u64(&mut self, v: u64) {
        self.out[self.pos..self.pos + 8].copy_from_slice(&v.to_le_bytes());
        self.pos += 8;
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.remaining() != 0 {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(())
    }
}
