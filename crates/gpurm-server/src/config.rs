use std::path::PathBuf;
use std::time::Duration;

use gpurm_engine::{EngineConfig, EngineKind, EngineSpec, MAX_ENGINES};
use gpurm_ipc::{DEFAULT_RENDEZVOUS_NAME, DEFAULT_SOCKET_PATH};
use gpurm_ring::{MAX_RING_KIB, MIN_RING_KIB};
use thiserror::Error;

pub const DEFAULT_GFX_ENGINES: usize = 4;
pub const DEFAULT_DMA_ENGINES: usize = 4;
pub const DEFAULT_GFX_RING_KIB: u32 = 256;
pub const DEFAULT_DMA_RING_KIB: u32 = 64;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
pub const DEFAULT_DISPLAY_HEADS: u32 = 1;
pub const MAX_DISPLAY_HEADS: u32 = 16;
pub const DEFAULT_APERTURE_MIB: u64 = 1024;
pub const APERTURE_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),

    #[error("too many engines ({count} > {})", MAX_ENGINES)]
    TooManyEngines { count: usize },

    #[error("ring size {kib}KiB for {var} is outside {}-{}KiB", MIN_RING_KIB, MAX_RING_KIB)]
    RingSize { var: &'static str, kib: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Name of the primary channel; `None` disables it.
    pub rendezvous_name: Option<String>,
    pub socket_path: PathBuf,
    pub gfx_engines: usize,
    pub dma_engines: usize,
    pub gfx_ring_kib: u32,
    pub dma_ring_kib: u32,
    pub poll_interval: Duration,
    pub display_heads: u32,
    pub aperture_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rendezvous_name: Some(DEFAULT_RENDEZVOUS_NAME.to_string()),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            gfx_engines: DEFAULT_GFX_ENGINES,
            dma_engines: DEFAULT_DMA_ENGINES,
            gfx_ring_kib: DEFAULT_GFX_RING_KIB,
            dma_ring_kib: DEFAULT_DMA_RING_KIB,
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            display_heads: DEFAULT_DISPLAY_HEADS,
            aperture_size: DEFAULT_APERTURE_MIB * 1024 * 1024,
        }
    }
}

fn parse_env<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv(var)),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::InvalidEnv(var)),
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let rendezvous = std::env::var("GPURM_RENDEZVOUS_NAME")
            .unwrap_or_else(|_| DEFAULT_RENDEZVOUS_NAME.into());
        let socket_path =
            std::env::var("GPURM_SOCKET_PATH").unwrap_or_else(|_| DEFAULT_SOCKET_PATH.into());
        if socket_path.trim().is_empty() {
            return Err(ConfigError::InvalidEnv("GPURM_SOCKET_PATH"));
        }

        let poll_ms = parse_env("GPURM_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS)?;
        if poll_ms == 0 {
            return Err(ConfigError::InvalidEnv("GPURM_POLL_INTERVAL_MS"));
        }
        let display_heads = parse_env("GPURM_DISPLAY_HEADS", DEFAULT_DISPLAY_HEADS)?;
        if !(1..=MAX_DISPLAY_HEADS).contains(&display_heads) {
            return Err(ConfigError::InvalidEnv("GPURM_DISPLAY_HEADS"));
        }
        let aperture_mib = parse_env("GPURM_APERTURE_MIB", DEFAULT_APERTURE_MIB)?;
        let aperture_size = aperture_mib
            .checked_mul(1024 * 1024)
            .filter(|&size| size > 0)
            .ok_or(ConfigError::InvalidEnv("GPURM_APERTURE_MIB"))?;

        let config = Self {
            rendezvous_name: (!rendezvous.trim().is_empty())
                .then(|| rendezvous.trim().to_string()),
            socket_path: PathBuf::from(socket_path),
            gfx_engines: parse_env("GPURM_GFX_ENGINES", DEFAULT_GFX_ENGINES)?,
            dma_engines: parse_env("GPURM_DMA_ENGINES", DEFAULT_DMA_ENGINES)?,
            gfx_ring_kib: parse_env("GPURM_GFX_RING_KIB", DEFAULT_GFX_RING_KIB)?,
            dma_ring_kib: parse_env("GPURM_DMA_RING_KIB", DEFAULT_DMA_RING_KIB)?,
            poll_interval: Duration::from_millis(poll_ms),
            display_heads,
            aperture_size,
        };
        config.engine_config()?;
        Ok(config)
    }

    /// GFX engines first, then DMA engines.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let count = self
            .gfx_engines
            .checked_add(self.dma_engines)
            .filter(|&count| count <= MAX_ENGINES)
            .ok_or(ConfigError::TooManyEngines {
                count: self.gfx_engines.saturating_add(self.dma_engines),
            })?;
        let gfx = EngineSpec::with_ring_kib(EngineKind::Gfx, self.gfx_ring_kib).map_err(|_| {
            ConfigError::RingSize {
                var: "GPURM_GFX_RING_KIB",
                kib: self.gfx_ring_kib,
            }
        })?;
        let dma = EngineSpec::with_ring_kib(EngineKind::Dma, self.dma_ring_kib).map_err(|_| {
            ConfigError::RingSize {
                var: "GPURM_DMA_RING_KIB",
                kib: self.dma_ring_kib,
            }
        })?;

        let mut engines = Vec::with_capacity(count);
        engines.extend(std::iter::repeat(gfx).take(self.gfx_engines));
        engines.extend(std::iter::repeat(dma).take(self.dma_engines));
        Ok(EngineConfig {
            engines,
            poll_interval: self.poll_interval,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_eight_engines() {
        let engines = ServerConfig::default().engine_config().unwrap();
        assert_eq!(engines.engines.len(), 8);
        assert_eq!(engines.engines[0].kind, EngineKind::Gfx);
        assert_eq!(engines.engines[0].ring_words, 256 * 1024 / 4);
        assert_eq!(engines.engines[7].kind, EngineKind::Dma);
        assert_eq!(engines.engines[7].ring_words, 64 * 1024 / 4);
        assert_eq!(engines.poll_interval, Duration::from_millis(10));
    }

    #[test]
    fn engine_limits_are_enforced() {
        let config = ServerConfig {
            gfx_engines: 6,
            dma_engines: 3,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.engine_config().unwrap_err(),
            ConfigError::TooManyEngines { count: 9 }
        );

        let config = ServerConfig {
            gfx_engines: usize::MAX,
            dma_engines: 1,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.engine_config().unwrap_err(),
            ConfigError::TooManyEngines { count: usize::MAX }
        );

        let config = ServerConfig {
            dma_ring_kib: 16,
            ..ServerConfig::default()
        };
        assert_eq!(
            config.engine_config().unwrap_err(),
            ConfigError::RingSize {
                var: "GPURM_DMA_RING_KIB",
                kib: 16
            }
        );
    }
}
