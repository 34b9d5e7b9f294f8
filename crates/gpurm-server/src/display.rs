use gpurm_ipc::{DisplayInfo, PixelFormat};
use thiserror::Error;

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_REFRESH: u32 = 60;
pub const DEFAULT_PIXEL_CLOCK_KHZ: u32 = 148_500;

const WIDTH_RANGE: std::ops::RangeInclusive<u32> = 640..=7680;
const HEIGHT_RANGE: std::ops::RangeInclusive<u32> = 480..=4320;
const REFRESH_RANGE: std::ops::RangeInclusive<u32> = 24..=240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DisplayError {
    #[error("display head {0} does not exist")]
    NoSuchHead(u32),

    #[error("unsupported mode {width}x{height}@{refresh}")]
    UnsupportedMode { width: u32, height: u32, refresh: u32 },

    #[error("unknown pixel format {0}")]
    UnknownFormat(u32),
}

/// CRTC timing derived from a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrtcTiming {
    pub h_sync_start: u32,
    pub h_sync_end: u32,
    pub h_total: u32,
    pub v_sync_start: u32,
    pub v_sync_end: u32,
    pub v_total: u32,
}

impl CrtcTiming {
    fn for_mode(width: u32, height: u32, refresh: u32) -> Self {
        let h_sync_width = width / 20;
        let h_sync_start = width + h_sync_width;
        let v_sync_width = (height * refresh / 1000).max(2);
        let v_sync_start = height + v_sync_width;
        Self {
            h_sync_start,
            h_sync_end: h_sync_start + h_sync_width,
            h_total: h_sync_start + width / 5,
            v_sync_start,
            v_sync_end: v_sync_start + v_sync_width,
            v_total: v_sync_start + height / 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayMode {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
    pub pixel_clock_khz: u32,
    pub format: PixelFormat,
    pub timing: CrtcTiming,
}

impl Default for DisplayMode {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            refresh: DEFAULT_REFRESH,
            pixel_clock_khz: DEFAULT_PIXEL_CLOCK_KHZ,
            format: PixelFormat::Argb8888,
            timing: CrtcTiming::for_mode(DEFAULT_WIDTH, DEFAULT_HEIGHT, DEFAULT_REFRESH),
        }
    }
}

impl DisplayMode {
    pub fn info(&self) -> DisplayInfo {
        DisplayInfo {
            width: self.width,
            height: self.height,
            refresh: self.refresh,
            pixel_clock: self.pixel_clock_khz,
        }
    }

    /// Bytes per scanline of the scanout surface.
    pub fn pitch(&self) -> u32 {
        self.width * self.format.bytes_per_pixel()
    }
}

/// Current mode of every display head.
#[derive(Debug, Clone)]
pub struct DisplayState {
    heads: Vec<DisplayMode>,
}

impl DisplayState {
    pub fn new(heads: u32) -> Self {
        Self {
            heads: vec![DisplayMode::default(); heads as usize],
        }
    }

    pub fn head_count(&self) -> u32 {
        self.heads.len() as u32
    }

    pub fn mode(&self, head: u32) -> Result<&DisplayMode, DisplayError> {
        self.heads
            .get(head as usize)
            .ok_or(DisplayError::NoSuchHead(head))
    }

    pub fn set_mode(
        &mut self,
        head: u32,
        width: u32,
        height: u32,
        refresh: u32,
        format: u32,
    ) -> Result<DisplayMode, DisplayError> {
        let slot = self
            .heads
            .get_mut(head as usize)
            .ok_or(DisplayError::NoSuchHead(head))?;
        if !WIDTH_RANGE.contains(&width)
            || !HEIGHT_RANGE.contains(&height)
            || !REFRESH_RANGE.contains(&refresh)
        {
            return Err(DisplayError::UnsupportedMode {
                width,
                height,
                refresh,
            });
        }
        let format = PixelFormat::from_u32(format).ok_or(DisplayError::UnknownFormat(format))?;

        let mode = DisplayMode {
            width,
            height,
            refresh,
            pixel_clock_khz: (width as u64 * height as u64 * refresh as u64 / 1000) as u32,
            format,
            timing: CrtcTiming::for_mode(width, height, refresh),
        };
        *slot = mode;
        tracing::info!(head, width, height, refresh, ?format, "display mode set");
        Ok(mode)
    }
}
