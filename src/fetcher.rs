//! Bounded download of untrusted remote documents.
//!
//! The body is streamed to disk chunk by chunk. Each read must make
//! progress within the idle timeout and the running total may never
//! exceed the size ceiling. Any failure removes whatever was written.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{Client, Url};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::format::{self, FileFormat};

/// Time and size bounds applied to every download.
#[derive(Debug, Clone, Copy)]
pub struct FetchLimits {
    /// Maximum wait for the response head or for the next body chunk.
    pub idle_timeout: Duration,
    pub max_bytes: u64,
}

/// A downloaded file whose type has been verified from its content.
///
/// Only [`Fetcher::fetch`] builds these, so holding one proves the
/// signature check passed.
#[derive(Debug, Clone)]
pub struct LocalArtifact {
    path: PathBuf,
    format: FileFormat,
    size: u64,
    sha256: String,
}

impl LocalArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> FileFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    /// File name used to derive the remote object name.
    pub fn basename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Parse and check a source reference. Only http(s) URLs are fetched.
pub fn validate_source(url: &str) -> Result<Url, PipelineError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::Input("the document URL is required".to_string()));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| PipelineError::Input(format!("malformed document URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(PipelineError::Input(format!(
            "unsupported URL scheme '{}'",
            other
        ))),
    }
}

/// `dest` with `.ext` appended to the full file name.
pub fn with_verified_extension(dest: &Path, ext: &str) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    limits: FetchLimits,
}

impl Fetcher {
    pub fn new(client: Client, limits: FetchLimits) -> Self {
        Self { client, limits }
    }

    /// Download `url` to `dest`, verify its signature and rename it to
    /// `<dest>.<ext>`. Leaves no file behind on failure.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<LocalArtifact, PipelineError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::fetch(url, format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        info!("Downloading document from {}", url);

        let (size, sha256) = match self.download(url, dest).await {
            Ok(done) => done,
            Err(e) => {
                remove_quietly(dest).await;
                return Err(e);
            }
        };

        let format = match format::detect_format(dest).await {
            Ok(Some(format)) => format,
            Ok(None) => {
                remove_quietly(dest).await;
                return Err(PipelineError::Format(format!(
                    "no supported signature in content from {}",
                    url
                )));
            }
            Err(e) => {
                remove_quietly(dest).await;
                return Err(PipelineError::fetch(url, format!("cannot inspect download: {}", e)));
            }
        };

        let final_path = with_verified_extension(dest, format.extension());
        if let Err(e) = tokio::fs::rename(dest, &final_path).await {
            remove_quietly(dest).await;
            return Err(PipelineError::fetch(url, format!("cannot rename download: {}", e)));
        }

        info!(
            "Downloaded {} ({} bytes, {}, sha256={})",
            final_path.display(),
            size,
            format.mime_type(),
            sha256
        );

        Ok(LocalArtifact {
            path: final_path,
            format,
            size,
            sha256,
        })
    }

    /// Stream the body into `dest`. Returns byte count and hex SHA-256.
    async fn download(&self, url: &str, dest: &Path) -> Result<(u64, String), PipelineError> {
        let idle = self.limits.idle_timeout;
        let max_bytes = self.limits.max_bytes;

        let mut response = tokio::time::timeout(idle, self.client.get(url).send())
            .await
            .map_err(|_| PipelineError::fetch(url, format!("no response within {:?}", idle)))?
            .map_err(|e| PipelineError::fetch(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::fetch(url, format!("HTTP {}", status)));
        }

        if let Some(declared) = response.content_length() {
            if declared > max_bytes {
                return Err(PipelineError::fetch(
                    url,
                    format!("declared size {} exceeds limit of {} bytes", declared, max_bytes),
                ));
            }
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| PipelineError::fetch(url, format!("cannot create {}: {}", dest.display(), e)))?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::time::timeout(idle, response.chunk())
                .await
                .map_err(|_| {
                    PipelineError::fetch(url, format!("stalled after {} bytes (idle {:?})", written, idle))
                })?
                .map_err(|e| PipelineError::fetch(url, e))?;

            let Some(chunk) = chunk else { break };

            written += chunk.len() as u64;
            if written > max_bytes {
                return Err(PipelineError::fetch(
                    url,
                    format!("body exceeds limit of {} bytes", max_bytes),
                ));
            }

            hasher.update(&chunk);
            file.write_all(&chunk)
                .await
                .map_err(|e| PipelineError::fetch(url, format!("write failed: {}", e)))?;
        }

        file.flush()
            .await
            .map_err(|e| PipelineError::fetch(url, format!("flush failed: {}", e)))?;

        debug!("Stream from {} complete: {} bytes", url, written);
        Ok((written, format!("{:x}", hasher.finalize())))
    }
}

/// Remove a file, ignoring "not found".
pub async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
    }
}
