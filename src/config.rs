//! Process configuration read from the environment.
//!
//! `.env` is loaded by `main` before [`AppConfig::from_env`] runs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::fetcher::FetchLimits;
use crate::ocr::JobPolicy;
use crate::pipeline::PipelineSettings;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 300;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub bucket: String,
    pub storage_key_path: PathBuf,
    pub vision_key_path: PathBuf,
    pub temp_dir: PathBuf,
    pub download_idle_timeout: Duration,
    pub max_download_bytes: u64,
    pub ocr_poll_interval: Duration,
    pub ocr_job_timeout: Duration,
    /// Whole-request bound for Cloud Storage, Vision and token calls.
    pub request_timeout: Duration,
    pub retain_uploads: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bucket = var("GCS_BUCKET").ok_or_else(|| anyhow!("GCS_BUCKET not set"))?;
        let default_key = var("GOOGLE_APPLICATION_CREDENTIALS");
        let key_path = |key: &str| -> Result<PathBuf> {
            var(key)
                .or_else(|| default_key.clone())
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("{} not set and GOOGLE_APPLICATION_CREDENTIALS missing", key))
        };

        Ok(Self {
            port: parse_or(&var, "PORT", DEFAULT_PORT)?,
            storage_key_path: key_path("GCP_STORAGE_KEY_PATH")?,
            vision_key_path: key_path("GCP_VISION_KEY_PATH")?,
            bucket,
            temp_dir: var("TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("boleto-intake")),
            download_idle_timeout: parse_secs(
                &var,
                "DOWNLOAD_IDLE_TIMEOUT_SECS",
                DEFAULT_IDLE_TIMEOUT_SECS,
            )?,
            max_download_bytes: parse_or(&var, "MAX_DOWNLOAD_BYTES", DEFAULT_MAX_DOWNLOAD_BYTES)?,
            ocr_poll_interval: parse_secs(&var, "OCR_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?,
            ocr_job_timeout: parse_secs(&var, "OCR_JOB_TIMEOUT_SECS", DEFAULT_JOB_TIMEOUT_SECS)?,
            request_timeout: parse_secs(&var, "GCP_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS)?,
            retain_uploads: parse_flag(&var, "RETAIN_UPLOADS")?,
        })
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            idle_timeout: self.download_idle_timeout,
            max_bytes: self.max_download_bytes,
        }
    }

    pub fn job_policy(&self) -> JobPolicy {
        JobPolicy {
            poll_interval: self.ocr_poll_interval,
            timeout: self.ocr_job_timeout,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            work_dir: self.temp_dir.clone(),
            retain_uploads: self.retain_uploads,
        }
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

/// Whole seconds, at least one.
fn parse_secs(var: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Result<Duration> {
    match parse_or(var, key, default)? {
        0 => Err(anyhow!("{} must be at least 1 second", key)),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn parse_flag(var: &impl Fn(&str) -> Option<String>, key: &str) -> Result<bool> {
    match var(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("Invalid value for {}: {:?}", key, v)),
        },
    }
}
