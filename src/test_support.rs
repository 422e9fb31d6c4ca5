//! Substitute capabilities and a tiny HTTP server for tests.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::ocr::{BatchOperation, OperationState, VisionApi};
use crate::storage::{BlobLocator, BlobStore};

pub const PDF: &[u8] = b"%PDF-1.7\n%\xe2\xe3\xcf\xd3\n";
pub const JPEG: &[u8] = &[0xff, 0xd8, 0xff, 0xe0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";
pub const WEBP: &[u8] = b"RIFF\x24\x00\x00\x00WEBPVP8 ";

/// `header` followed by zero bytes up to `len`.
pub fn padded(header: &[u8], len: usize) -> Vec<u8> {
    let mut data = header.to_vec();
    data.resize(len.max(header.len()), 0);
    data
}

/// One batch output object as written by the Vision API.
pub fn batch_output(text: Option<&str>) -> Vec<u8> {
    let response = match text {
        Some(text) => serde_json::json!({ "fullTextAnnotation": { "text": text } }),
        None => serde_json::json!({}),
    };
    serde_json::to_vec(&serde_json::json!({ "responses": [response] })).unwrap()
}

// ── HTTP test server ────────────────────────────────────────────────────────

#[derive(Clone)]
pub enum Reply {
    /// 200 with `Content-Length`.
    Ok(Vec<u8>),
    /// Empty response with the given status.
    Status(u16),
    /// 200 with chunked transfer encoding and no declared length.
    Chunked(Vec<u8>),
    /// Declares `declared_len`, sends `head`, then goes silent.
    Stall { head: Vec<u8>, declared_len: usize },
}

/// Serve `reply` to every connection. Returns the document URL.
pub async fn serve(reply: Reply) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let reply = reply.clone();
            tokio::spawn(async move {
                read_request_head(&mut socket).await;
                let _ = write_reply(&mut socket, reply).await;
            });
        }
    });

    format!("http://{}/boleto", addr)
}

async fn read_request_head(socket: &mut TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = socket.read(&mut buf).await.unwrap_or(0);
        if n == 0 {
            return;
        }
        head.extend_from_slice(&buf[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            return;
        }
    }
}

async fn write_reply(socket: &mut TcpStream, reply: Reply) -> std::io::Result<()> {
    match reply {
        Reply::Ok(body) => {
            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await?;
            socket.write_all(&body).await?;
        }
        Reply::Status(code) => {
            let head = format!(
                "HTTP/1.1 {} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                code
            );
            socket.write_all(head.as_bytes()).await?;
        }
        Reply::Chunked(body) => {
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n")
                .await?;
            for chunk in body.chunks(4096) {
                socket.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                socket.write_all(chunk).await?;
                socket.write_all(b"\r\n").await?;
            }
            socket.write_all(b"0\r\n\r\n").await?;
        }
        Reply::Stall { head, declared_len } => {
            let status = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                declared_len
            );
            socket.write_all(status.as_bytes()).await?;
            socket.write_all(&head).await?;
            socket.flush().await?;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
    }
    socket.flush().await?;
    socket.shutdown().await
}

// ── In-memory object storage ────────────────────────────────────────────────

struct StoredObject {
    data: Vec<u8>,
    content_type: String,
}

/// Bucket held in memory. Listing is in name order, like Cloud Storage.
pub struct MemoryBlobStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    deleted: Mutex<Vec<String>>,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemoryBlobStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            deleted: Mutex::new(Vec::new()),
            fail_uploads: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    pub fn fail_uploads(&self) {
        self.fail_uploads.store(true, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self) {
        self.fail_deletes.store(true, Ordering::SeqCst);
    }

    pub fn put(&self, name: &str, data: Vec<u8>, content_type: &str) {
        self.objects.lock().unwrap().insert(
            name.to_string(),
            StoredObject {
                data,
                content_type: content_type.to_string(),
            },
        );
    }

    pub fn object(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(name).map(|o| o.data.clone())
    }

    pub fn content_type(&self, name: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(name)
            .map(|o| o.content_type.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|n| n.starts_with(prefix))
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(
        &self,
        local_path: &Path,
        object_name: &str,
        content_type: &str,
    ) -> Result<BlobLocator> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated upload outage"));
        }
        let data = tokio::fs::read(local_path).await?;
        self.put(object_name, data, content_type);
        Ok(BlobLocator::new(self.bucket.clone(), object_name))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobLocator>> {
        Ok(self
            .names_with_prefix(prefix)
            .into_iter()
            .map(|n| BlobLocator::new(self.bucket.clone(), n))
            .collect())
    }

    async fn download(&self, locator: &BlobLocator) -> Result<Vec<u8>> {
        self.object(&locator.name)
            .ok_or_else(|| anyhow!("no such object {}", locator))
    }

    async fn delete(&self, locator: &BlobLocator) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("simulated delete failure"));
        }
        self.objects.lock().unwrap().remove(&locator.name);
        self.deleted.lock().unwrap().push(locator.name.clone());
        Ok(())
    }
}

// ── Scripted Vision backend ─────────────────────────────────────────────────

#[derive(Default)]
struct VisionCalls {
    images: Vec<String>,
    submissions: u32,
    polls: u32,
}

/// Vision stand-in. Batch submissions write the scripted outputs into
/// the store under the requested prefix, as the real service does.
pub struct ScriptedVision {
    store: Arc<MemoryBlobStore>,
    image_text: Option<String>,
    image_fails: bool,
    submit_fails: bool,
    batch_outputs: Vec<Vec<u8>>,
    running_polls: u32,
    operation_error: Option<String>,
    calls: Mutex<VisionCalls>,
}

impl ScriptedVision {
    pub fn new(store: Arc<MemoryBlobStore>) -> Self {
        Self {
            store,
            image_text: None,
            image_fails: false,
            submit_fails: false,
            batch_outputs: Vec::new(),
            running_polls: 0,
            operation_error: None,
            calls: Mutex::new(VisionCalls::default()),
        }
    }

    pub fn with_image_text(mut self, text: Option<&str>) -> Self {
        self.image_text = text.map(str::to_string);
        self
    }

    pub fn failing_image(mut self) -> Self {
        self.image_fails = true;
        self
    }

    pub fn failing_submit(mut self) -> Self {
        self.submit_fails = true;
        self
    }

    pub fn with_batch_outputs(mut self, outputs: Vec<Vec<u8>>) -> Self {
        self.batch_outputs = outputs;
        self
    }

    /// Report `Running` for this many polls before finishing.
    pub fn running_polls(mut self, polls: u32) -> Self {
        self.running_polls = polls;
        self
    }

    pub fn failing_operation(mut self, reason: &str) -> Self {
        self.operation_error = Some(reason.to_string());
        self
    }

    pub fn image_calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().images.clone()
    }

    pub fn batch_submissions(&self) -> u32 {
        self.calls.lock().unwrap().submissions
    }

    pub fn polls(&self) -> u32 {
        self.calls.lock().unwrap().polls
    }
}

#[async_trait::async_trait]
impl VisionApi for ScriptedVision {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn recognize_image(&self, image: &BlobLocator) -> Result<Option<String>> {
        self.calls.lock().unwrap().images.push(image.uri());
        if self.image_fails {
            return Err(anyhow!("simulated Vision outage"));
        }
        Ok(self.image_text.clone())
    }

    async fn submit_batch(
        &self,
        _input: &BlobLocator,
        _mime_type: &str,
        output_prefix: &BlobLocator,
    ) -> Result<BatchOperation> {
        let submission = {
            let mut calls = self.calls.lock().unwrap();
            calls.submissions += 1;
            calls.submissions
        };
        if self.submit_fails {
            return Err(anyhow!("simulated batch rejection"));
        }

        for (i, output) in self.batch_outputs.iter().enumerate() {
            let name = format!("{}output-{}-to-{}.json", output_prefix.name, i + 1, i + 1);
            self.store.put(&name, output.clone(), "application/json");
        }

        Ok(BatchOperation {
            name: format!("operations/{}", submission),
        })
    }

    async fn operation_state(&self, _operation: &BatchOperation) -> Result<OperationState> {
        let polls = {
            let mut calls = self.calls.lock().unwrap();
            calls.polls += 1;
            calls.polls
        };

        if polls <= self.running_polls {
            return Ok(OperationState::Running);
        }
        Ok(match &self.operation_error {
            Some(reason) => OperationState::Failed(reason.clone()),
            None => OperationState::Done,
        })
    }
}
