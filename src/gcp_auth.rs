//! Service-account authentication for Google Cloud REST APIs.
//!
//! Mints an RS256 JWT from the service-account key, exchanges it for an
//! OAuth2 access token and caches the token until shortly before expiry.
//! One instance per key file and scope, shared by the client that owns it.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
pub const VISION_SCOPE: &str = "https://www.googleapis.com/auth/cloud-vision";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// Refresh this many seconds before the token actually expires.
const EXPIRY_MARGIN_SECS: u64 = 60;

#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: u64,
}

#[derive(Clone)]
pub struct ServiceAccountAuth {
    key: ServiceAccountKey,
    scope: String,
    token_cache: Arc<Mutex<Option<CachedToken>>>,
}

impl ServiceAccountAuth {
    /// Load a service-account JSON key file for the given OAuth scope.
    pub fn from_key_file(path: &Path, scope: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read service account key {:?}", path))?;
        Self::from_key_json(&json, scope)
            .with_context(|| format!("Invalid service account key {:?}", path))
    }

    pub fn from_key_json(json: &str, scope: &str) -> Result<Self> {
        let key: ServiceAccountKey =
            serde_json::from_str(json).context("Failed to parse service account key")?;

        Ok(Self {
            key,
            scope: scope.to_string(),
            token_cache: Arc::new(Mutex::new(None)),
        })
    }

    pub fn client_email(&self) -> &str {
        &self.key.client_email
    }

    fn token_uri(&self) -> &str {
        self.key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }

    fn cached(&self, now: u64) -> Option<String> {
        let cache = self.token_cache.lock().ok()?;
        cache
            .as_ref()
            .filter(|t| now < t.expires_at.saturating_sub(EXPIRY_MARGIN_SECS))
            .map(|t| t.access_token.clone())
    }

    /// Signed JWT asserting this account's identity for its scope.
    fn assertion(&self, issued_at: u64) -> Result<String> {
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: self.token_uri(),
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("Service account private key is not RSA PEM")?;

        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &signing_key,
        )
        .context("Failed to sign assertion")
    }

    async fn exchange(&self, client: &reqwest::Client, assertion: &str) -> Result<TokenGrant> {
        let resp = client
            .post(self.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion)])
            .send()
            .await
            .with_context(|| format!("Token request to {} failed", self.token_uri()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("Token endpoint rejected {} ({}): {}", self.key.client_email, status, text);
        }

        resp.json().await.context("Malformed token response")
    }

    /// Access token for this account and scope, minted on cache miss.
    pub async fn access_token(&self, client: &reqwest::Client) -> Result<String> {
        let now = now_secs();
        if let Some(token) = self.cached(now) {
            return Ok(token);
        }

        let grant = self.exchange(client, &self.assertion(now)?).await?;
        debug!(
            "New token for {} on {} valid {}s",
            self.key.client_email, self.scope, grant.expires_in
        );

        if let Ok(mut cache) = self.token_cache.lock() {
            *cache = Some(CachedToken {
                access_token: grant.access_token.clone(),
                expires_at: now + grant.expires_in,
            });
        }
        Ok(grant.access_token)
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

#[derive(Deserialize)]
struct TokenGrant {
    access_token: String,
    expires_in: u64,
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
