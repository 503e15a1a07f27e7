//! Remote table state store over HTTP
//!
//! Talks to a small REST table service:
//!
//! ```text
//! GET    {base}/scopes/{scope}/resources/{id}   -> record | 404
//! PUT    {base}/scopes/{scope}/resources/{id}   <- record
//! DELETE {base}/scopes/{scope}/resources/{id}
//! GET    {base}/scopes/{scope}/resources        -> {"ids": [...]}
//! GET    {base}/scopes?prefix={scope}           -> {"scopes": [...]}
//! ```
//!
//! Any transport failure fails closed. Key locks are machine-local lock files.

use super::{KeyGuard, KeyLockDir, StateStore};
use crate::error::{Result, StateError};
use crate::record::{ResourceRecord, ScopePath, validate_segment};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::path::Path;

pub struct HttpStateStore {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    locks: KeyLockDir,
}

#[derive(Deserialize)]
struct IdList {
    ids: Vec<String>,
}

#[derive(Deserialize)]
struct ScopeList {
    scopes: Vec<String>,
}

impl HttpStateStore {
    pub fn new(base_url: impl Into<String>, token: Option<String>, lock_dir: impl AsRef<Path>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            locks: KeyLockDir::new(lock_dir),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn scope_url(&self, scope: &ScopePath) -> String {
        format!("{}/scopes/{}/resources", self.base_url, encode_segment(&scope.to_string()))
    }

    fn record_url(&self, scope: &ScopePath, id: &str) -> String {
        format!("{}/{}", self.scope_url(scope), encode_segment(id))
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Percent-encode one path segment
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(StateError::Backend(format!(
        "{} failed with {}: {}",
        what,
        status,
        body.trim()
    )))
}

#[async_trait]
impl StateStore for HttpStateStore {
    fn name(&self) -> &str {
        "http"
    }

    async fn init(&self) -> Result<()> {
        // Reachability probe so an unreachable backend fails before any transition
        let url = format!("{}/scopes?prefix=", self.base_url);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        check_status(response, "state backend probe").await?;
        Ok(())
    }

    async fn get(&self, scope: &ScopePath, id: &str) -> Result<Option<ResourceRecord>> {
        let url = self.record_url(scope, id);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, &format!("GET {}", scope.fqn(id))).await?;
        let record: ResourceRecord = response.json().await.map_err(|e| StateError::Corrupt {
            key: scope.fqn(id),
            message: e.to_string(),
        })?;
        record.check_version()?;
        Ok(Some(record))
    }

    async fn set(&self, scope: &ScopePath, id: &str, record: &ResourceRecord) -> Result<()> {
        validate_segment(id)?;
        let url = self.record_url(scope, id);
        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(record)
            .send()
            .await?;
        check_status(response, &format!("PUT {}", scope.fqn(id))).await?;
        tracing::debug!("Wrote remote state record {} ({})", scope.fqn(id), record.status);
        Ok(())
    }

    async fn delete(&self, scope: &ScopePath, id: &str) -> Result<()> {
        let url = self.record_url(scope, id);
        let response = self.request(reqwest::Method::DELETE, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, &format!("DELETE {}", scope.fqn(id))).await?;
        Ok(())
    }

    async fn list(&self, scope: &ScopePath) -> Result<Vec<String>> {
        let url = self.scope_url(scope);
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = check_status(response, &format!("LIST {}", scope)).await?;
        let mut ids = response.json::<IdList>().await?.ids;
        ids.sort();
        Ok(ids)
    }

    async fn list_scopes(&self, prefix: &ScopePath) -> Result<Vec<ScopePath>> {
        let url = format!(
            "{}/scopes?prefix={}",
            self.base_url,
            encode_segment(&prefix.to_string())
        );
        let response = self.request(reqwest::Method::GET, &url).send().await?;
        let response = check_status(response, &format!("LIST SCOPES {}", prefix)).await?;
        let mut scopes = response
            .json::<ScopeList>()
            .await?
            .scopes
            .into_iter()
            .map(|s| s.parse::<ScopePath>())
            .collect::<Result<Vec<_>>>()?;
        // The server may match raw string prefixes; keep whole-segment matches only
        scopes.retain(|s| s.starts_with(prefix));
        scopes.sort();
        Ok(scopes)
    }

    async fn lock(&self, scope: &ScopePath, id: &str) -> Result<KeyGuard> {
        validate_segment(id)?;
        self.locks.lock(scope, id).await
    }
}
