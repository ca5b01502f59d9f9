use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::sync::{CacheConfig, UploadConfig};

const DEFAULT_CACHE_DIR_NAME: &str = "clouddrive";
const DEFAULT_CACHE_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_UPLOAD_CONCURRENCY: u64 = 2;
const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
const DEFAULT_TIMEOUT_RECHECK_SECS: u64 = 30;
const DEFAULT_DUPLICATE_CHECK_SECS: u64 = 600;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    pub cache_root: PathBuf,
    pub cache_max_bytes: u64,
    pub upload_concurrency: usize,
    pub verify_content_id: bool,
    pub retry_delay: Duration,
    pub timeout_recheck: Duration,
    pub duplicate_check_interval: Duration,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Ok(Self::from_lookup(&home, |name| std::env::var(name).ok()))
    }

    /// Builds the configuration from `lookup`, falling back to defaults for
    /// missing or unparsable values. Zero is kept except for the upload
    /// concurrency.
    pub fn from_lookup(home: &Path, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read_u64 = |name: &str, default: u64| parse_u64(lookup(name), default);
        let cache_root = lookup("CLOUDDRIVE_CACHE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_cache_root);
        let upload_concurrency = match read_u64(
            "CLOUDDRIVE_UPLOAD_CONCURRENCY",
            DEFAULT_UPLOAD_CONCURRENCY,
        ) {
            0 => DEFAULT_UPLOAD_CONCURRENCY,
            value => value,
        };

        Self {
            cache_root,
            cache_max_bytes: read_u64("CLOUDDRIVE_CACHE_MAX_BYTES", DEFAULT_CACHE_MAX_BYTES),
            upload_concurrency: upload_concurrency as usize,
            verify_content_id: parse_bool(lookup("CLOUDDRIVE_VERIFY_CONTENT_ID"), true),
            retry_delay: Duration::from_millis(read_u64(
                "CLOUDDRIVE_RETRY_DELAY_MS",
                DEFAULT_RETRY_DELAY_MS,
            )),
            timeout_recheck: Duration::from_secs(read_u64(
                "CLOUDDRIVE_TIMEOUT_RECHECK_SECS",
                DEFAULT_TIMEOUT_RECHECK_SECS,
            )),
            duplicate_check_interval: Duration::from_secs(read_u64(
                "CLOUDDRIVE_DUPLICATE_CHECK_SECS",
                DEFAULT_DUPLICATE_CHECK_SECS,
            )),
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.cache_max_bytes,
        }
    }

    pub fn upload_config(&self) -> UploadConfig {
        UploadConfig {
            concurrency: self.upload_concurrency.max(1),
            verify_content_id: self.verify_content_id,
            retry_delay: self.retry_delay,
            timeout_recheck: self.timeout_recheck,
            duplicate_check_interval: self.duplicate_check_interval,
        }
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DEFAULT_CACHE_DIR_NAME)
}

fn parse_u64(value: Option<String>, default: u64) -> u64 {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
