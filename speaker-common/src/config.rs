//! Configuration loading
//!
//! The system is configured from a TOML file. Every field has a built-in
//! default, so a missing file or a partial file still yields a usable
//! configuration. Values are validated once after loading.

use crate::format::{DownmixGain, SampleFormat};
use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Transport volume range (dB-like steps)
pub const VOLUME_MIN_DB: i32 = -64;
pub const VOLUME_MAX_DB: i32 = 63;

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Number of source pipelines feeding the mixer
    pub source_count: usize,

    /// Event poll timeout used by each `handle_events` call
    pub poll_timeout_ms: u64,

    /// Volume applied at initialization
    pub default_volume_db: i32,

    pub storage: StorageConfig,
    pub mixer: MixerConfig,
    pub buffers: BufferConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}

/// Storage peripheral configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Prefix source URIs are addressed by (e.g. "/spiffs")
    pub mount_point: String,
    /// Local directory backing the mount point
    pub root: PathBuf,
    /// First wait between mount readiness checks
    pub retry_interval_ms: u64,
    /// Backoff ceiling between readiness checks
    pub max_retry_interval_ms: u64,
    /// Readiness checks before giving up
    pub max_mount_attempts: u32,
}

/// Mixer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Format assumed for each source until its decoder reports
    pub default_source: SampleFormat,
    /// Fixed output format
    pub destination: SampleFormat,
    /// Downmix gain as `[start, target]` in dB
    pub gain_db: [f32; 2],
    /// Ramp time from start to target gain
    pub transit_time_ms: u32,
    /// Duration of one mixed chunk
    pub chunk_ms: u64,
}

/// Buffer sizing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Raw buffer capacity per source, in milliseconds
    ///
    /// Sized for `max_source` (or the default source format, if larger), so a
    /// source decoding at a higher rate or channel count holds proportionally
    /// less time.
    pub raw_buffer_ms: u64,
    /// Largest source format the raw buffers are sized for
    pub max_source: SampleFormat,
    /// Bounded queue depth between mixer and output sink, in chunks
    pub output_queue_chunks: usize,
}

/// Output transport selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// System audio device via cpal
    Cpal,
    /// Discard output (headless runs)
    Null,
}

impl std::str::FromStr for OutputBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpal" => Ok(OutputBackend::Cpal),
            "null" => Ok(OutputBackend::Null),
            other => Err(Error::InvalidInput(format!("unknown output backend '{}'", other))),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub backend: OutputBackend,
    /// Output device name (None = default device)
    pub device: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            source_count: 2,
            poll_timeout_ms: 1000,
            default_volume_db: 0,
            storage: StorageConfig::default(),
            mixer: MixerConfig::default(),
            buffers: BufferConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mount_point: "/spiffs".to_string(),
            root: PathBuf::from("./spiffs"),
            retry_interval_ms: 500,
            max_retry_interval_ms: 4000,
            max_mount_attempts: 10,
        }
    }
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            default_source: SampleFormat::DEFAULT,
            destination: SampleFormat::DEFAULT,
            gain_db: [0.0, 0.0],
            transit_time_ms: 0,
            chunk_ms: 20,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            raw_buffer_ms: 500,
            max_source: SampleFormat::new(48000, 2, 16),
            output_queue_chunks: 4,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            backend: OutputBackend::Cpal,
            device: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl MixerConfig {
    /// Downmix parameters applied to every source slot
    pub fn downmix(&self) -> DownmixGain {
        DownmixGain::new(self.gain_db[0], self.gain_db[1], self.transit_time_ms)
    }
}

impl SystemConfig {
    /// Parse configuration from TOML text and validate it
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SystemConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Load from `path` (or the platform default location); fall back to
    /// built-in defaults when no file exists
    ///
    /// A file that exists but fails to parse or validate is still an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let candidate = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };

        match candidate {
            Some(p) if p.exists() => Self::load(&p),
            Some(p) => {
                warn!("Config file {} not found, using built-in defaults", p.display());
                Ok(Self::default())
            }
            None => {
                warn!("No config file location available, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the runtime cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.source_count == 0 {
            return Err(Error::Config("source_count must be at least 1".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(Error::Config("poll_timeout_ms must be non-zero".to_string()));
        }
        self.mixer
            .default_source
            .validate()
            .map_err(|e| Error::Config(format!("mixer.default_source: {}", e)))?;
        self.mixer
            .destination
            .validate()
            .map_err(|e| Error::Config(format!("mixer.destination: {}", e)))?;
        self.buffers
            .max_source
            .validate()
            .map_err(|e| Error::Config(format!("buffers.max_source: {}", e)))?;
        if self.mixer.chunk_ms == 0 {
            return Err(Error::Config("mixer.chunk_ms must be non-zero".to_string()));
        }
        if self.buffers.raw_buffer_ms < self.mixer.chunk_ms {
            return Err(Error::Config(format!(
                "buffers.raw_buffer_ms ({}) must cover at least one chunk ({}ms)",
                self.buffers.raw_buffer_ms, self.mixer.chunk_ms
            )));
        }
        if self.buffers.output_queue_chunks == 0 {
            return Err(Error::Config("buffers.output_queue_chunks must be non-zero".to_string()));
        }
        if self.storage.max_mount_attempts == 0 {
            return Err(Error::Config("storage.max_mount_attempts must be non-zero".to_string()));
        }
        if !(VOLUME_MIN_DB..=VOLUME_MAX_DB).contains(&self.default_volume_db) {
            return Err(Error::Config(format!(
                "default_volume_db {} outside {}..={}",
                self.default_volume_db, VOLUME_MIN_DB, VOLUME_MAX_DB
            )));
        }
        Ok(())
    }

    /// Raw buffer capacity per source, in interleaved samples
    pub fn raw_buffer_samples(&self) -> usize {
        let ms = self.buffers.raw_buffer_ms;
        [self.buffers.max_source, self.mixer.default_source]
            .iter()
            .map(|format| format.samples_for_frames(format.frames_for_ms(ms)))
            .max()
            .unwrap_or(0)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// Platform default config location (`<config dir>/speaker/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("speaker").join("config.toml"))
}
