use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TesseraError;
use crate::types::Result;

/// Default User-Agent sent by HTTP map sources.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Knobs consumed by the download pipeline.
///
/// Every field has a default, so a config file only needs to name the values
/// it changes:
///
/// ```
/// use tessera_core::DownloadConfig;
///
/// let config = DownloadConfig::from_toml_str("workers = 8\nmax_download_retries = 3\n")?;
/// assert_eq!(config.workers, 8);
/// assert_eq!(config.retry_error_threshold, 50);
/// # Ok::<(), tessera_core::TesseraError>(())
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Number of worker threads in the pool.
    pub workers: usize,
    /// Retries granted to a transiently failing job after its first attempt.
    pub max_download_retries: u32,
    /// Retryable failures tolerated per map before the decision point fires.
    pub retry_error_threshold: u64,
    /// Interval at which the orchestrator re-checks drain and error state.
    pub poll_interval_ms: u64,
    /// Capacity of the bounded job queue between producer and workers.
    pub queue_capacity: usize,
    /// Upper bound on tiles that must come from online sources.
    pub max_online_tiles: u64,
    /// Directory for temporary download archives; the system temp dir when unset.
    pub work_dir: Option<PathBuf>,
    pub http: HttpOptions,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_download_retries: 1,
            retry_error_threshold: 50,
            poll_interval_ms: 500,
            queue_capacity: 256,
            max_online_tiles: 50_000_000,
            work_dir: None,
            http: HttpOptions::default(),
        }
    }
}

impl DownloadConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|error| TesseraError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_file_over(path, &Self::default())
    }

    /// Parses `raw` layered over `base`: keys the TOML names win, every
    /// other setting keeps the value it has in `base`.
    pub fn from_toml_str_over(raw: &str, base: &DownloadConfig) -> Result<Self> {
        let overrides: toml::Table = toml::from_str(raw).map_err(config_error)?;
        let mut merged = match toml::Value::try_from(base).map_err(config_error)? {
            toml::Value::Table(table) => table,
            other => {
                return Err(TesseraError::Config(format!(
                    "base config serialized to a {} instead of a table",
                    other.type_str()
                )));
            }
        };
        merge_tables(&mut merged, overrides);

        let config: Self = toml::Value::Table(merged)
            .try_into()
            .map_err(config_error)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file_over(path: impl AsRef<Path>, base: &DownloadConfig) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|error| {
            TesseraError::Io(error).with_context(format!("read config {}", path.display()))
        })?;
        Self::from_toml_str_over(&raw, base)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(TesseraError::Config("workers must be at least 1".into()));
        }
        if self.queue_capacity == 0 {
            return Err(TesseraError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(TesseraError::Config(
                "poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.work_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

fn config_error(error: impl std::fmt::Display) -> TesseraError {
    TesseraError::Config(error.to_string())
}

fn merge_tables(base: &mut toml::Table, overrides: toml::Table) {
    for (key, value) in overrides {
        match value {
            toml::Value::Table(nested) => {
                if let Some(toml::Value::Table(inner)) = base.get_mut(&key) {
                    merge_tables(inner, nested);
                } else {
                    base.insert(key, toml::Value::Table(nested));
                }
            }
            value => {
                base.insert(key, value);
            }
        }
    }
}

/// Connection settings shared by HTTP-backed map sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpOptions {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub user_agent: String,
    pub accept: String,
    /// PEM certificate that replaces the built-in roots when set.
    pub pinned_certificate: Option<PathBuf>,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            read_timeout_ms: 10_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept: "image/png,image/*;q=0.9,*/*;q=0.8".to_string(),
            pinned_certificate: None,
        }
    }
}

impl HttpOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}
