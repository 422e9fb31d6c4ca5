//! Client-code → handler lookup for inbound webhooks.
//!
//! The registry is built once at startup. Unknown codes simply miss;
//! nothing is loaded based on request data.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::pipeline::{SlipPayload, SlipPipeline};

/// Client code served by [`SlipHandler`].
pub const SLIP_CLIENT: &str = "boleto";

#[async_trait::async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, PipelineError>;
}

/// Runs the payment slip pipeline for a `{"url": ...}` payload.
pub struct SlipHandler {
    pipeline: Arc<SlipPipeline>,
}

impl SlipHandler {
    pub fn new(pipeline: Arc<SlipPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait::async_trait]
impl WebhookHandler for SlipHandler {
    async fn handle(&self, payload: serde_json::Value) -> Result<serde_json::Value, PipelineError> {
        let payload: SlipPayload = serde_json::from_value(payload)
            .map_err(|e| PipelineError::Input(format!("malformed payload: {}", e)))?;

        let result = self.pipeline.process(&payload).await?;
        serde_json::to_value(result).map_err(|_| PipelineError::Processing)
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, client_code: &str, handler: Arc<dyn WebhookHandler>) -> Self {
        self.handlers.insert(client_code.to_string(), handler);
        self
    }

    pub fn get(&self, client_code: &str) -> Option<Arc<dyn WebhookHandler>> {
        self.handlers.get(client_code).cloned()
    }

    /// Registered client codes, sorted.
    pub fn codes(&self) -> Vec<String> {
        let mut codes: Vec<String> = self.handlers.keys().cloned().collect();
        codes.sort();
        codes
    }
}
