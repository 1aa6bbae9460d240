//! Execution strategy, loadable from TOML
//!
//! # Example Config File
//!
//! ```toml
//! # graft.toml
//!
//! # Steps folded into one device call (default: 1)
//! batches_per_step = 4
//!
//! # Create a training session (default: true)
//! is_training = true
//!
//! # Keep weights in binary16 on the device (default: false)
//! enable_fp16 = false
//!
//! # Pull weights back to the host every N training steps (default: 1)
//! save_per_n_step = 100
//!
//! # Snapshot the session after preparation / at every pull
//! save_init_checkpoint = false
//! save_last_checkpoint = true
//!
//! # Devices to acquire, rounded up to a power of two (default: 1)
//! num_devices = 1
//!
//! # Run on a one-device software model instead of hardware
//! use_model_device = false
//!
//! checkpoint_dir = "/tmp/graft"
//!
//! # "skip" or "error" for feed names missing from the graph
//! feed_policy = "skip"
//! ```

use graft_compiler::FeedPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root of a config file
///
/// Supports two formats:
///
/// 1. **Sectioned format** (for config files shared with other tools):
/// ```toml
/// [graft]
/// batches_per_step = 4
/// ```
///
/// 2. **Direct format**:
/// ```toml
/// batches_per_step = 4
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    graft: Option<Strategy>,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    direct: Option<Strategy>,
}

/// How sessions are created and driven
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Strategy {
    /// Steps folded into one device call; outputs gain a leading dim of this
    /// size when greater than 1
    pub batches_per_step: usize,

    pub is_training: bool,

    /// Narrow weights to binary16 on the way to the device
    pub enable_fp16: bool,

    /// Training steps between weight pulls
    pub save_per_n_step: usize,

    /// Write `checkpoint_init.bin` after preparation
    pub save_init_checkpoint: bool,

    /// Write `checkpoint_step_<n>.bin` at every weight pull
    pub save_last_checkpoint: bool,

    /// Requested device count, rounded up to a power of two at attach
    pub num_devices: usize,

    pub use_model_device: bool,

    pub checkpoint_dir: PathBuf,

    pub feed_policy: FeedPolicy,
}

impl Default for Strategy {
    fn default() -> Self {
        Self {
            batches_per_step: 1,
            is_training: true,
            enable_fp16: false,
            save_per_n_step: 1,
            save_init_checkpoint: false,
            save_last_checkpoint: false,
            num_devices: 1,
            use_model_device: false,
            checkpoint_dir: PathBuf::from("."),
            feed_policy: FeedPolicy::Skip,
        }
    }
}

impl Strategy {
    /// Strategy for a training run
    pub fn training() -> Self {
        Self::default()
    }

    /// Strategy for an inference run
    pub fn inference() -> Self {
        Self {
            is_training: false,
            ..Self::default()
        }
    }

    /// Load a strategy from a TOML file in sectioned or direct format
    ///
    /// ```no_run
    /// use graft_runtime::config::Strategy;
    ///
    /// let strategy = Strategy::load("graft.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;

        let root: RootConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(path.as_ref().to_path_buf(), e))?;

        let strategy = root.graft.or(root.direct).unwrap_or_default();
        strategy.validate()?;
        Ok(strategy)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self).map_err(ConfigError::SerializeError)?;
        std::fs::write(path.as_ref(), contents)
            .map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;
        Ok(())
    }

    /// Reject values no session can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batches_per_step == 0 {
            return Err(ConfigError::Invalid("batches_per_step must be at least 1".to_string()));
        }
        if self.save_per_n_step == 0 {
            return Err(ConfigError::Invalid("save_per_n_step must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn with_batches_per_step(mut self, n: usize) -> Self {
        self.batches_per_step = n;
        self
    }

    pub fn with_training(mut self, is_training: bool) -> Self {
        self.is_training = is_training;
        self
    }

    pub fn with_fp16(mut self, enable: bool) -> Self {
        self.enable_fp16 = enable;
        self
    }

    pub fn with_save_per_n_step(mut self, n: usize) -> Self {
        self.save_per_n_step = n;
        self
    }

    pub fn with_init_checkpoint(mut self, enable: bool) -> Self {
        self.save_init_checkpoint = enable;
        self
    }

    pub fn with_step_checkpoints(mut self, enable: bool) -> Self {
        self.save_last_checkpoint = enable;
        self
    }

    pub fn with_num_devices(mut self, n: usize) -> Self {
        self.num_devices = n;
        self
    }

    pub fn with_model_device(mut self, enable: bool) -> Self {
        self.use_model_device = enable;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn with_feed_policy(mut self, policy: FeedPolicy) -> Self {
        self.feed_policy = policy;
        self
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, #[source] toml::de::Error),

    /// Failed to serialize config
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),

    #[error("Invalid strategy: {0}")]
    Invalid(String),
}
