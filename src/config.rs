//! Configuration loaded from a YAML file with environment overrides.
//!
//! Every key has a default except the account identity (`api.id`,
//! `api.hash`, `api.phone`), which is validated at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

const DEFAULT_DOWNLOAD_PATH: &str = "./downloads";
const DEFAULT_SESSION_DIR: &str = "./sessions";
const DEFAULT_LOG_LEVEL: &str = "info";

const DEFAULT_MAX_CONCURRENT: usize = 5;
const DEFAULT_BATCH_SIZE: i32 = 100;
const DEFAULT_CHUNK_SIZE_KIB: i64 = 512;
const DEFAULT_MAX_WORKERS: usize = 4;

const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BASE_DELAY_SECS: u64 = 1;
const DEFAULT_MAX_DELAY_SECS: u64 = 30;

const DEFAULT_REQUESTS_PER_SECOND: f64 = 1.0;
const DEFAULT_BURST_SIZE: u32 = 2;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub id: i32,
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_download_path")]
    pub path: String,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// History page size.
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    /// Chunk size in KiB; see [`DownloadConfig::chunk_size_bytes`].
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    /// Workers per file for the chunked path.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Enable the parallel chunked path for files over 1 MiB.
    #[serde(default)]
    pub use_chunked: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatConfig {
    /// Target chat id; 0 means ask interactively.
    #[serde(default)]
    pub target_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_dir")]
    pub dir: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds.
    #[serde(default = "default_base_delay")]
    pub base_delay: u64,
    /// Seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

fn default_download_path() -> String {
    DEFAULT_DOWNLOAD_PATH.to_string()
}
fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}
fn default_batch_size() -> i32 {
    DEFAULT_BATCH_SIZE
}
fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE_KIB
}
fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_session_dir() -> String {
    DEFAULT_SESSION_DIR.to_string()
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_base_delay() -> u64 {
    DEFAULT_BASE_DELAY_SECS
}
fn default_max_delay() -> u64 {
    DEFAULT_MAX_DELAY_SECS
}
fn default_requests_per_second() -> f64 {
    DEFAULT_REQUESTS_PER_SECOND
}
fn default_burst_size() -> u32 {
    DEFAULT_BURST_SIZE
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            path: default_download_path(),
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            chunk_size: default_chunk_size(),
            max_workers: default_max_workers(),
            use_chunked: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: default_session_dir(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst_size: default_burst_size(),
        }
    }
}

impl Config {
    /// Load from the YAML file (if it exists), apply environment
    /// overrides, and validate the account identity.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
            serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the environment. The lookup is injected so
    /// tests can script it.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(value: Option<String>) -> Option<T> {
            value.and_then(|v| v.parse().ok())
        }

        if let Some(id) = parse(get("API_ID")) {
            self.api.id = id;
        }
        if let Some(hash) = get("API_HASH") {
            self.api.hash = hash;
        }
        if let Some(phone) = get("PHONE") {
            self.api.phone = phone;
        }

        if let Some(path) = get("DOWNLOAD_PATH") {
            self.download.path = path;
        }
        if let Some(n) = parse(get("MAX_CONCURRENT_DOWNLOADS")) {
            self.download.max_concurrent = n;
        }
        if let Some(n) = parse(get("BATCH_SIZE")) {
            self.download.batch_size = n;
        }
        if let Some(n) = parse(get("CHUNK_SIZE")) {
            self.download.chunk_size = n;
        }
        if let Some(n) = parse(get("MAX_WORKERS")) {
            self.download.max_workers = n;
        }
        if let Some(b) = parse(get("USE_CHUNKED")) {
            self.download.use_chunked = b;
        }

        if let Some(id) = parse(get("TARGET_CHAT_ID")) {
            self.chat.target_id = id;
        }
        if let Some(level) = get("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(dir) = get("SESSION_DIR") {
            self.session.dir = dir;
        }

        if let Some(n) = parse(get("MAX_RETRIES")) {
            self.retry.max_retries = n;
        }
        if let Some(n) = parse(get("BASE_DELAY")) {
            self.retry.base_delay = n;
        }
        if let Some(n) = parse(get("MAX_DELAY")) {
            self.retry.max_delay = n;
        }

        if let Some(rps) = parse(get("REQUESTS_PER_SECOND")) {
            self.rate_limit.requests_per_second = rps;
        }
        if let Some(n) = parse(get("BURST_SIZE")) {
            self.rate_limit.burst_size = n;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.api.id == 0 || self.api.hash.is_empty() || self.api.phone.is_empty() {
            return Err(Error::Config(
                "missing required account identity: api.id, api.hash, api.phone \
                 (or API_ID, API_HASH, PHONE)"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

impl DownloadConfig {
    /// `chunk_size` is KiB in the file; bytes everywhere else.
    pub fn chunk_size_bytes(&self) -> i64 {
        self.chunk_size * 1024
    }
}
