//! Upload of validated artifacts to durable storage.

use std::sync::Arc;

use tracing::info;

use crate::error::{self, PipelineError};
use crate::fetcher::LocalArtifact;
use crate::storage::{BlobLocator, BlobStore};

/// Namespace for uploaded inputs awaiting OCR.
pub const UPLOAD_PREFIX: &str = "temp/";

#[derive(Clone)]
pub struct BlobPublisher {
    store: Arc<dyn BlobStore>,
}

impl BlobPublisher {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    /// Object name for an artifact: the upload prefix plus its basename.
    pub fn object_name(artifact: &LocalArtifact) -> String {
        format!("{}{}", UPLOAD_PREFIX, artifact.basename())
    }

    /// Upload the artifact and return its locator. The local file is
    /// left in place.
    pub async fn publish(&self, artifact: &LocalArtifact) -> Result<BlobLocator, PipelineError> {
        let name = Self::object_name(artifact);

        let locator = self
            .store
            .upload(artifact.path(), &name, artifact.format().mime_type())
            .await
            .map_err(|e| PipelineError::Publish(error::chain(&e)))?;

        info!("Published {} as {}", artifact.path().display(), locator);
        Ok(locator)
    }
}
