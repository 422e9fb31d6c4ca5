//! Payment slip intake pipeline.
//!
//! fetch → publish → recognise → extract, for one request. The local
//! artifact lives only for the duration of a run and is removed on every
//! exit path. Stage errors are logged here and reported to the caller as
//! a single [`PipelineError::Processing`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::fetcher::{self, Fetcher};
use crate::fields::{self, ExtractionResult, Field};
use crate::ocr::{self, JobPolicy, OcrOrchestrator, VisionApi};
use crate::publisher::BlobPublisher;
use crate::storage::{BlobLocator, BlobStore};

/// Inbound request body.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlipPayload {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Directory for local artifacts; created on demand.
    pub work_dir: PathBuf,
    /// Keep the uploaded input object after OCR.
    pub retain_uploads: bool,
}

/// Removes the run's local files when dropped. Missing files are fine.
struct ArtifactGuard {
    paths: Vec<PathBuf>,
}

impl ArtifactGuard {
    fn new(path: PathBuf) -> Self {
        Self { paths: vec![path] }
    }

    fn track(&mut self, path: &Path) {
        if !self.paths.iter().any(|p| p == path) {
            self.paths.push(path.to_path_buf());
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        for path in &self.paths {
            match std::fs::remove_file(path) {
                Ok(()) => debug!("Removed local artifact {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove local artifact {}: {}", path.display(), e),
            }
        }
    }
}

pub struct SlipPipeline {
    fetcher: Fetcher,
    publisher: BlobPublisher,
    ocr: OcrOrchestrator,
    store: Arc<dyn BlobStore>,
    settings: PipelineSettings,
}

impl SlipPipeline {
    pub fn new(
        fetcher: Fetcher,
        store: Arc<dyn BlobStore>,
        vision: Arc<dyn VisionApi>,
        job_policy: JobPolicy,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            fetcher,
            publisher: BlobPublisher::new(store.clone()),
            ocr: OcrOrchestrator::new(vision, store.clone(), job_policy),
            store,
            settings,
        }
    }

    /// Process one payload. Input problems are returned as
    /// [`PipelineError::Input`]; any later failure as `Processing`.
    pub async fn process(&self, payload: &SlipPayload) -> Result<ExtractionResult, PipelineError> {
        let source = fetcher::validate_source(payload.url.as_deref().unwrap_or_default())?;
        let run_id = ocr::correlation_id();

        match self.run(&run_id, source.as_str()).await {
            Ok(result) => {
                info!("[{}] Extraction completed successfully", run_id);
                Ok(result)
            }
            Err(e) => {
                error!("[{}] Processing failed at {} stage: {}", run_id, e.stage(), e);
                Err(PipelineError::Processing)
            }
        }
    }

    /// Run every stage, returning the stage-specific error on failure.
    pub(crate) async fn run(&self, run_id: &str, url: &str) -> Result<ExtractionResult, PipelineError> {
        let dest = self.settings.work_dir.join(run_id);
        let mut guard = ArtifactGuard::new(dest.clone());

        let artifact = self.fetcher.fetch(url, &dest).await?;
        guard.track(artifact.path());
        debug!(
            "[{}] Artifact {} ({} bytes, sha256={})",
            run_id,
            artifact.basename(),
            artifact.size(),
            artifact.sha256()
        );

        let locator = self.publisher.publish(&artifact).await?;

        let recognized = self
            .ocr
            .recognize(&locator, artifact.format().mime_type())
            .await;
        self.release_upload(&locator).await;
        let text = recognized?;

        debug!("[{}] {} chars of text from {}", run_id, text.len(), locator);
        let result = fields::extract_fields(&text);
        if result.is_empty() {
            warn!("[{}] No payment fields recognised in {}", run_id, locator);
        } else {
            let found: Vec<String> = Field::ALL
                .iter()
                .map(|&f| format!("{}={}", f.key(), result.get(f).len()))
                .collect();
            info!("[{}] Fields found: {}", run_id, found.join(", "));
        }
        Ok(result)
    }

    async fn release_upload(&self, locator: &BlobLocator) {
        if self.settings.retain_uploads {
            return;
        }
        if let Err(e) = self.store.delete(locator).await {
            warn!("Failed to delete uploaded input {}: {:#}", locator, e);
        }
    }
}
