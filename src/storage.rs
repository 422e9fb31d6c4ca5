//! Durable object storage.
//!
//! [`BlobStore`] is the narrow capability the pipeline consumes;
//! [`GcsStore`] implements it over the Cloud Storage JSON API.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info};

use crate::gcp_auth::ServiceAccountAuth;

const API_BASE: &str = "https://storage.googleapis.com/storage/v1/";
const UPLOAD_BASE: &str = "https://storage.googleapis.com/upload/storage/v1/";

/// Fully-qualified address of an object: `gs://bucket/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobLocator {
    pub bucket: String,
    pub name: String,
}

impl BlobLocator {
    pub fn new(bucket: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            name: name.into(),
        }
    }

    pub fn uri(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.name)
    }
}

/// Object storage operations used by the pipeline.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Upload a local file as `object_name`. The object is either
    /// written completely or not at all.
    async fn upload(&self, local_path: &Path, object_name: &str, content_type: &str)
        -> Result<BlobLocator>;

    /// List objects whose name starts with `prefix`, in name order.
    async fn list(&self, prefix: &str) -> Result<Vec<BlobLocator>>;

    async fn download(&self, locator: &BlobLocator) -> Result<Vec<u8>>;

    async fn delete(&self, locator: &BlobLocator) -> Result<()>;
}

/// Cloud Storage client bound to one bucket.
#[derive(Clone)]
pub struct GcsStore {
    client: Client,
    bucket: String,
    auth: ServiceAccountAuth,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectItem {
    name: String,
}

impl GcsStore {
    pub fn new(client: Client, bucket: impl Into<String>, auth: ServiceAccountAuth) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            auth,
        }
    }

    async fn token(&self) -> Result<String> {
        self.auth
            .access_token(&self.client)
            .await
            .context("Failed to authenticate with Cloud Storage")
    }
}

fn object_url(bucket: &str, name: &str) -> Result<Url> {
    let mut url = Url::parse(API_BASE)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Storage API base URL cannot hold a path"))?
        .pop_if_empty()
        .extend(["b", bucket, "o", name]);
    Ok(url)
}

fn upload_url(bucket: &str, name: &str) -> Result<Url> {
    let mut url = Url::parse(UPLOAD_BASE)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Storage upload base URL cannot hold a path"))?
        .pop_if_empty()
        .extend(["b", bucket, "o"]);
    url.query_pairs_mut()
        .append_pair("uploadType", "media")
        .append_pair("name", name);
    Ok(url)
}

fn list_url(bucket: &str, prefix: &str, page_token: Option<&str>) -> Result<Url> {
    let mut url = Url::parse(API_BASE)?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("Storage API base URL cannot hold a path"))?
        .pop_if_empty()
        .extend(["b", bucket, "o"]);
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("prefix", prefix).append_pair("fields", "items(name),nextPageToken");
        if let Some(token) = page_token {
            query.append_pair("pageToken", token);
        }
    }
    Ok(url)
}

#[async_trait::async_trait]
impl BlobStore for GcsStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn upload(
        &self,
        local_path: &Path,
        object_name: &str,
        content_type: &str,
    ) -> Result<BlobLocator> {
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("Failed to read {:?} for upload", local_path))?;
        let size = data.len();
        let token = self.token().await?;

        let resp = self
            .client
            .post(upload_url(&self.bucket, object_name)?)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await
            .context("Upload request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Cloud Storage upload error ({}): {}", status, text);
        }

        let locator = BlobLocator::new(self.bucket.clone(), object_name);
        info!("Uploaded {} bytes to {}", size, locator);
        Ok(locator)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<BlobLocator>> {
        let token = self.token().await?;
        let mut found = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let resp = self
                .client
                .get(list_url(&self.bucket, prefix, page_token.as_deref())?)
                .bearer_auth(&token)
                .send()
                .await
                .context("List request failed")?;

            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("Cloud Storage list error ({}): {}", status, text);
            }

            let page: ObjectList = resp.json().await.context("Failed to parse object list")?;
            found.extend(
                page.items
                    .into_iter()
                    .map(|item| BlobLocator::new(self.bucket.clone(), item.name)),
            );

            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        debug!("Listed {} objects under gs://{}/{}", found.len(), self.bucket, prefix);
        Ok(found)
    }

    async fn download(&self, locator: &BlobLocator) -> Result<Vec<u8>> {
        let token = self.token().await?;
        let mut url = object_url(&locator.bucket, &locator.name)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let resp = self
            .client
            .get(url)
            .bearer_auth(&token)
            .send()
            .await
            .with_context(|| format!("Download request failed for {}", locator))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Cloud Storage download error for {} ({}): {}", locator, status, text);
        }

        let bytes = resp.bytes().await?;
        debug!("Downloaded {} bytes from {}", bytes.len(), locator);
        Ok(bytes.to_vec())
    }

    async fn delete(&self, locator: &BlobLocator) -> Result<()> {
        let token = self.token().await?;

        let resp = self
            .client
            .delete(object_url(&locator.bucket, &locator.name)?)
            .bearer_auth(&token)
            .send()
            .await
            .with_context(|| format!("Delete request failed for {}", locator))?;

        let status = resp.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            debug!("Deleted {}", locator);
            return Ok(());
        }

        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("Cloud Storage delete error for {} ({}): {}", locator, status, text);
    }
}
