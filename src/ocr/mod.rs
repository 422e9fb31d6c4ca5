//! OCR orchestration.
//!
//! Defines the [`VisionApi`] capability and the [`OcrOrchestrator`], which
//! picks a [`Recognition`] strategy from the document's MIME type:
//! single images are recognised inline, paginated documents go through an
//! asynchronous batch job whose output lands in object storage and is
//! collected (and removed) once the job finishes.

pub mod vision;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{self, PipelineError};
use crate::storage::{BlobLocator, BlobStore};

/// Namespace for batch job output.
pub const RESULTS_PREFIX: &str = "resultados/";

/// Handle of a submitted batch recognition job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOperation {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Failed(String),
}

/// Async trait implemented by each OCR backend.
#[async_trait::async_trait]
pub trait VisionApi: Send + Sync {
    fn name(&self) -> &str;

    /// Synchronous document text detection. `None` when no text was found.
    async fn recognize_image(&self, image: &BlobLocator) -> anyhow::Result<Option<String>>;

    /// Start batch recognition of `input`, writing results under `output_prefix`.
    async fn submit_batch(
        &self,
        input: &BlobLocator,
        mime_type: &str,
        output_prefix: &BlobLocator,
    ) -> anyhow::Result<BatchOperation>;

    async fn operation_state(&self, operation: &BatchOperation) -> anyhow::Result<OperationState>;
}

/// How a document is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recognition {
    /// One request, text returned inline.
    SingleImage,
    /// Submit, wait for completion, collect results from storage.
    BatchDocument,
}

impl Recognition {
    pub fn for_mime(mime_type: &str) -> Self {
        if mime_type.eq_ignore_ascii_case("application/pdf") {
            Self::BatchDocument
        } else {
            Self::SingleImage
        }
    }
}

/// Polling cadence and deadline for batch jobs.
#[derive(Debug, Clone, Copy)]
pub struct JobPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

/// Per-run batch job state. The output prefix is unique to the run, so
/// concurrent jobs never see each other's results.
#[derive(Debug, Clone)]
pub struct RecognitionJob {
    pub run_id: String,
    pub output_prefix: String,
}

impl RecognitionJob {
    pub fn new() -> Self {
        let run_id = correlation_id();
        let output_prefix = format!("{}{}/", RESULTS_PREFIX, run_id);
        Self {
            run_id,
            output_prefix,
        }
    }
}

/// Time-based id with a random suffix: `<unix-millis>_<6 hex chars>`.
pub fn correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", millis, &suffix[..6])
}

/// Starting page of a batch output object (`output-3-to-3.json` → 3).
fn output_page(name: &str) -> Option<u32> {
    let file = name.rsplit('/').next()?;
    let rest = file.strip_prefix("output-")?;
    rest.split('-').next()?.parse().ok()
}

fn ocr_error(context: &str, err: &anyhow::Error) -> PipelineError {
    PipelineError::Ocr(format!("{}: {}", context, error::chain(err)))
}

#[derive(Clone)]
pub struct OcrOrchestrator {
    vision: Arc<dyn VisionApi>,
    store: Arc<dyn BlobStore>,
    policy: JobPolicy,
}

impl OcrOrchestrator {
    pub fn new(vision: Arc<dyn VisionApi>, store: Arc<dyn BlobStore>, policy: JobPolicy) -> Self {
        Self {
            vision,
            store,
            policy,
        }
    }

    /// Recognise the document at `input` and return its plain text.
    pub async fn recognize(&self, input: &BlobLocator, mime_type: &str) -> Result<String, PipelineError> {
        let strategy = Recognition::for_mime(mime_type);
        info!(
            "Recognising {} ({}) via {} as {:?}",
            input,
            mime_type,
            self.vision.name(),
            strategy
        );

        let text = match strategy {
            Recognition::SingleImage => self.recognize_image(input).await?,
            Recognition::BatchDocument => self.recognize_document(input, mime_type).await?,
        };

        info!("Recognised {} chars from {}", text.len(), input);
        Ok(text)
    }

    async fn recognize_image(&self, input: &BlobLocator) -> Result<String, PipelineError> {
        let text = self
            .vision
            .recognize_image(input)
            .await
            .map_err(|e| ocr_error("image recognition failed", &e))?;
        Ok(text.unwrap_or_default())
    }

    async fn recognize_document(&self, input: &BlobLocator, mime_type: &str) -> Result<String, PipelineError> {
        let job = RecognitionJob::new();
        let output = BlobLocator::new(self.store.bucket(), job.output_prefix.clone());

        let operation = self
            .vision
            .submit_batch(input, mime_type, &output)
            .await
            .map_err(|e| ocr_error("batch submission failed", &e))?;

        debug!("Job {} submitted as {}", job.run_id, operation.name);
        if let Err(e) = self.await_completion(&operation).await {
            self.discard_results(&job).await;
            return Err(e);
        }
        self.collect_results(&job).await
    }

    /// Best-effort removal of whatever a failed or abandoned job wrote.
    async fn discard_results(&self, job: &RecognitionJob) {
        let objects = match self.store.list(&job.output_prefix).await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("Failed to list output of job {}: {:#}", job.run_id, e);
                return;
            }
        };

        for object in &objects {
            if let Err(e) = self.store.delete(object).await {
                warn!("Failed to delete OCR result {}: {:#}", object, e);
            }
        }
        if !objects.is_empty() {
            debug!("Discarded {} result objects of job {}", objects.len(), job.run_id);
        }
    }

    /// Poll the operation until it finishes or the job deadline passes.
    async fn await_completion(&self, operation: &BatchOperation) -> Result<(), PipelineError> {
        let started = Instant::now();

        loop {
            let state = self
                .vision
                .operation_state(operation)
                .await
                .map_err(|e| ocr_error("operation status failed", &e))?;

            match state {
                OperationState::Done => {
                    info!(
                        "Operation {} finished after {:?}",
                        operation.name,
                        started.elapsed()
                    );
                    return Ok(());
                }
                OperationState::Failed(reason) => {
                    return Err(PipelineError::Ocr(format!(
                        "operation {} failed: {}",
                        operation.name, reason
                    )));
                }
                OperationState::Running => {
                    debug!("Operation {} still running", operation.name);
                }
            }

            if started.elapsed() >= self.policy.timeout {
                return Err(PipelineError::Ocr(format!(
                    "operation {} did not finish within {:?}",
                    operation.name, self.policy.timeout
                )));
            }

            tokio::time::sleep(self.policy.poll_interval).await;
        }
    }

    /// Read and delete every output object of the job.
    ///
    /// Deletion is attempted for every object. The first download or
    /// parse failure is returned after the loop.
    async fn collect_results(&self, job: &RecognitionJob) -> Result<String, PipelineError> {
        let mut objects = self
            .store
            .list(&job.output_prefix)
            .await
            .map_err(|e| ocr_error("listing results failed", &e))?;

        if objects.is_empty() {
            return Err(PipelineError::Ocr(format!(
                "no results found in gs://{}/{}",
                self.store.bucket(),
                job.output_prefix
            )));
        }

        // listing is lexicographic; output-10 would sort before output-2
        objects.sort_by_key(|o| (output_page(&o.name).unwrap_or(u32::MAX), o.name.clone()));

        let mut full_text = String::new();
        let mut failure: Option<PipelineError> = None;

        for object in &objects {
            if failure.is_none() {
                match self.read_result(object).await {
                    Ok(text) => full_text.push_str(&text),
                    Err(e) => failure = Some(e),
                }
            }

            if let Err(e) = self.store.delete(object).await {
                warn!("Failed to delete OCR result {}: {:#}", object, e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                debug!(
                    "Collected {} result objects for job {}",
                    objects.len(),
                    job.run_id
                );
                Ok(full_text)
            }
        }
    }

    async fn read_result(&self, object: &BlobLocator) -> Result<String, PipelineError> {
        let bytes = self
            .store
            .download(object)
            .await
            .map_err(|e| ocr_error(&format!("downloading {} failed", object), &e))?;

        vision::parse_batch_output(&bytes)
            .map_err(|e| ocr_error(&format!("malformed OCR output in {}", object), &e))
    }
}
