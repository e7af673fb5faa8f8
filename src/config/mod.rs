use std::path::PathBuf;
use std::time::Duration;

use garde::Validate;
use serde::Deserialize;
use strum::Display;

use crate::services::retry::RetryPolicy;

/// Scheduling variant for a run.
#[derive(Debug, Clone, Copy, Deserialize, Display, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RunMode {
    /// Route traffic through Tor and rotate the circuit between batches.
    #[default]
    Rotating,
    /// Direct connection with a fixed pause between batches.
    Cooldown,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// OCR service host, without trailing path
    #[serde(default = "default_base_url")]
    #[garde(length(min = 1))]
    pub base_url: String,

    /// Directory scanned for images
    #[serde(default = "default_source_dir")]
    #[garde(skip)]
    pub source_dir: PathBuf,

    /// Directory receiving one `<name>.txt` per processed image
    #[serde(default = "default_response_dir")]
    #[garde(skip)]
    pub response_dir: PathBuf,

    /// Append-only run log
    #[serde(default = "default_log_file")]
    #[garde(skip)]
    pub log_file: PathBuf,

    #[serde(default)]
    #[garde(skip)]
    pub mode: RunMode,

    /// Images per batch. Defaults to 2 when rotating, 1 with cooldown.
    #[serde(default)]
    #[garde(range(min = 1))]
    pub batch_size: Option<usize>,

    /// Rotate identity before every K-th batch (rotating mode)
    #[serde(default = "default_every")]
    #[garde(range(min = 1))]
    pub rotate_every: usize,

    /// Pause after every K-th batch (cooldown mode)
    #[serde(default = "default_every")]
    #[garde(range(min = 1))]
    pub cooldown_every: usize,

    #[serde(default = "default_cooldown_secs")]
    #[garde(skip)]
    pub cooldown_secs: u64,

    /// Ask the service to classify each image instead of using `force_class_id`
    #[serde(default)]
    #[garde(skip)]
    pub classify: bool,

    #[serde(default = "default_force_class_id")]
    #[garde(skip)]
    pub force_class_id: i64,

    #[serde(default = "default_ocr_max_attempts")]
    #[garde(range(min = 1))]
    pub ocr_max_attempts: u32,

    #[serde(default = "default_ocr_retry_base_ms")]
    #[garde(skip)]
    pub ocr_retry_base_ms: u64,

    #[serde(default = "default_tor_binary")]
    #[garde(skip)]
    pub tor_binary: PathBuf,

    /// Prefix of the Tor state directories in the working directory
    #[serde(default = "default_tor_data_dir_prefix")]
    #[garde(length(min = 1))]
    pub tor_data_dir_prefix: String,

    #[serde(default = "default_tor_bootstrap_timeout_secs")]
    #[garde(range(min = 1))]
    pub tor_bootstrap_timeout_secs: u64,
}

fn default_base_url() -> String {
    "https://tools.clc.hcmus.edu.vn".to_string()
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("processed_images")
}

fn default_response_dir() -> PathBuf {
    PathBuf::from("response")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("log.txt")
}

fn default_every() -> usize {
    2
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_force_class_id() -> i64 {
    1
}

fn default_ocr_max_attempts() -> u32 {
    3
}

fn default_ocr_retry_base_ms() -> u64 {
    1000
}

fn default_tor_binary() -> PathBuf {
    PathBuf::from("tor")
}

fn default_tor_data_dir_prefix() -> String {
    "data-dir-".to_string()
}

fn default_tor_bootstrap_timeout_secs() -> u64 {
    120
}

/// How the batch loop partitions work and when it rotates or pauses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
    pub batch_size: usize,
    /// Rotate before batch `i` when `i % rotate_every == 0`.
    pub rotate_every: Option<usize>,
    /// Pause after batch `i` when `(i + 1) % cooldown_every == 0`, never after the last.
    pub cooldown_every: Option<usize>,
    pub cooldown: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn schedule(&self) -> SchedulePolicy {
        match self.mode {
            RunMode::Rotating => SchedulePolicy {
                batch_size: self.batch_size.unwrap_or(2),
                rotate_every: Some(self.rotate_every),
                cooldown_every: None,
                cooldown: Duration::ZERO,
            },
            RunMode::Cooldown => SchedulePolicy {
                batch_size: self.batch_size.unwrap_or(1),
                rotate_every: None,
                cooldown_every: Some(self.cooldown_every),
                cooldown: Duration::from_secs(self.cooldown_secs),
            },
        }
    }

    pub fn ocr_retry(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.ocr_max_attempts,
            base_delay: Duration::from_millis(self.ocr_retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    /// Class id to use for every image, or `None` to classify each one.
    pub fn class_override(&self) -> Option<i64> {
        (!self.classify).then_some(self.force_class_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(#[from] garde::Report),
}
