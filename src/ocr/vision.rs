//! Google Cloud Vision document text detection.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{BatchOperation, OperationState, VisionApi};
use crate::gcp_auth::ServiceAccountAuth;
use crate::storage::BlobLocator;

const VISION_API_BASE: &str = "https://vision.googleapis.com/v1";
const FEATURE: &str = "DOCUMENT_TEXT_DETECTION";

pub struct GoogleVision {
    client: Client,
    auth: ServiceAccountAuth,
}

impl GoogleVision {
    pub fn new(client: Client, auth: ServiceAccountAuth) -> Self {
        Self { client, auth }
    }

    async fn post_json<B: Serialize>(&self, url: &str, body: &B) -> Result<String> {
        let token = self
            .auth
            .access_token(&self.client)
            .await
            .context("Failed to authenticate with Cloud Vision")?;

        let resp = self
            .client
            .post(url)
            .bearer_auth(&token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Cloud Vision API error ({}): {}", status, text);
        }

        Ok(resp.text().await?)
    }
}

// ── Vision API request/response types ───────────────────────────────────────

#[derive(Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct AnnotateImagesRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
struct AnnotateImageRequest {
    image: Image,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct Image {
    source: ImageSource,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource {
    image_uri: String,
}

#[derive(Serialize)]
struct AsyncBatchAnnotateFilesRequest {
    requests: Vec<AsyncAnnotateFileRequest>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AsyncAnnotateFileRequest {
    input_config: InputConfig,
    features: Vec<Feature>,
    output_config: OutputConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InputConfig {
    gcs_source: GcsUri,
    mime_type: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutputConfig {
    gcs_destination: GcsUri,
    batch_size: u32,
}

#[derive(Serialize)]
struct GcsUri {
    uri: String,
}

/// Shape of `images:annotate` responses and of each batch output file.
#[derive(Debug, Deserialize)]
pub(crate) struct AnnotateResponses {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateImageResponse {
    #[serde(default)]
    full_text_annotation: Option<TextAnnotation>,
    #[serde(default)]
    error: Option<ApiStatus>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    name: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<ApiStatus>,
}

impl AnnotateResponses {
    /// Concatenated full text of every response; missing text is empty.
    pub(crate) fn full_text(&self) -> String {
        self.responses
            .iter()
            .filter_map(|r| r.full_text_annotation.as_ref())
            .map(|a| a.text.as_str())
            .collect()
    }

    fn first_error(&self) -> Option<&ApiStatus> {
        self.responses.iter().find_map(|r| r.error.as_ref())
    }
}

/// Parse one batch output object written by `files:asyncBatchAnnotate`.
pub(crate) fn parse_batch_output(bytes: &[u8]) -> Result<String> {
    let parsed: AnnotateResponses =
        serde_json::from_slice(bytes).context("Batch output is not valid annotate JSON")?;
    if let Some(err) = parsed.first_error() {
        debug!("Batch output carries page error {}: {}", err.code, err.message);
    }
    Ok(parsed.full_text())
}

fn features() -> Vec<Feature> {
    vec![Feature { kind: FEATURE }]
}

#[async_trait::async_trait]
impl VisionApi for GoogleVision {
    fn name(&self) -> &str {
        "google_vision"
    }

    async fn recognize_image(&self, image: &BlobLocator) -> Result<Option<String>> {
        let body = AnnotateImagesRequest {
            requests: vec![AnnotateImageRequest {
                image: Image {
                    source: ImageSource {
                        image_uri: image.uri(),
                    },
                },
                features: features(),
            }],
        };

        info!("GoogleVision: document text detection for {}", image);
        let raw = self
            .post_json(&format!("{}/images:annotate", VISION_API_BASE), &body)
            .await?;

        let parsed: AnnotateResponses =
            serde_json::from_str(&raw).context("Failed to parse annotate response")?;

        if let Some(err) = parsed.first_error() {
            anyhow::bail!("Vision rejected {} ({}): {}", image, err.code, err.message);
        }

        Ok(parsed
            .responses
            .into_iter()
            .next()
            .and_then(|r| r.full_text_annotation)
            .map(|a| a.text))
    }

    async fn submit_batch(
        &self,
        input: &BlobLocator,
        mime_type: &str,
        output_prefix: &BlobLocator,
    ) -> Result<BatchOperation> {
        let body = AsyncBatchAnnotateFilesRequest {
            requests: vec![AsyncAnnotateFileRequest {
                input_config: InputConfig {
                    gcs_source: GcsUri { uri: input.uri() },
                    mime_type: mime_type.to_string(),
                },
                features: features(),
                output_config: OutputConfig {
                    gcs_destination: GcsUri {
                        uri: output_prefix.uri(),
                    },
                    batch_size: 1,
                },
            }],
        };

        info!(
            "GoogleVision: submitting batch annotation {} -> {}",
            input, output_prefix
        );
        let raw = self
            .post_json(&format!("{}/files:asyncBatchAnnotate", VISION_API_BASE), &body)
            .await?;

        let operation: Operation =
            serde_json::from_str(&raw).context("Failed to parse batch operation")?;
        info!("GoogleVision: operation {} started", operation.name);

        Ok(BatchOperation {
            name: operation.name,
        })
    }

    async fn operation_state(&self, operation: &BatchOperation) -> Result<OperationState> {
        let token = self
            .auth
            .access_token(&self.client)
            .await
            .context("Failed to authenticate with Cloud Vision")?;

        let resp = self
            .client
            .get(format!("{}/{}", VISION_API_BASE, operation.name))
            .bearer_auth(&token)
            .send()
            .await
            .context("Operation status request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Cloud Vision operation error ({}): {}", status, text);
        }

        let op: Operation = resp.json().await.context("Failed to parse operation status")?;
        Ok(operation_state(&op))
    }
}

fn operation_state(op: &Operation) -> OperationState {
    match (&op.error, op.done) {
        (Some(err), _) => OperationState::Failed(format!("{} ({})", err.message, err.code)),
        (None, true) => OperationState::Done,
        (None, false) => OperationState::Running,
    }
}
