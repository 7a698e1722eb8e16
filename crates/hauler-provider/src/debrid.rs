//! HTTP adapter for an AllDebrid-style provider API.
//!
//! The API wraps every response in `{status, data}` and reports
//! manifest entries in several shapes (`files`/`links` arrays, nested
//! `e` entries, long or abbreviated field names). Everything is
//! normalised here; callers only see [`ProviderPoll`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::rate_limit::RateLimiter;
use crate::{ProviderClient, ProviderError, ProviderFile, ProviderPoll};

const LINK_REF_PREFIX: &str = "link:";

/// Error codes the provider will never recover from.
const TERMINAL_CODES: &[&str] = &[
    "MAGNET_INVALID_URI",
    "MAGNET_INVALID_ID",
    "MAGNET_MUST_BE_PREMIUM",
    "MAGNET_NO_SERVER",
    "MAGNET_PROCESSING_FAILED",
    "MAGNET_INTERNAL_ERROR",
    "LINK_DOWN",
    "LINK_HOST_NOT_SUPPORTED",
    "LINK_HOST_UNAVAILABLE",
    "LINK_PASS_PROTECTED",
];

/// Connection settings for [`DebridClient`].
#[derive(Debug, Clone)]
pub struct DebridConfig {
    /// API base URL, no trailing slash.
    pub base_url: String,
    /// API key sent with every call.
    pub api_key: String,
    /// Application identifier sent with every call.
    pub agent: String,
    /// Token bucket refill rate, requests per second.
    pub rate_per_sec: f64,
    /// Token bucket burst size.
    pub rate_burst: u32,
    /// Concurrent unlock calls.
    pub unlock_concurrency: u32,
    /// Connect timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Duration,
}

impl Default for DebridConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.alldebrid.com/v4.1".to_owned(),
            api_key: String::new(),
            agent: "hauler".to_owned(),
            rate_per_sec: 2.0,
            rate_burst: 4,
            unlock_concurrency: 4,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
        }
    }
}

/// Debrid API client.
///
/// All calls pass through the shared rate limiter; unlock calls are
/// additionally bounded by a semaphore so a burst of file starts
/// cannot monopolise the provider.
pub struct DebridClient {
    http: reqwest::Client,
    config: DebridConfig,
    limiter: Arc<RateLimiter>,
    unlock_permits: Arc<Semaphore>,
}

impl std::fmt::Debug for DebridClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebridClient")
            .field("base_url", &self.config.base_url)
            .finish_non_exhaustive()
    }
}

impl DebridClient {
    /// Build a client from connection settings.
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the HTTP client cannot be built.
    pub fn new(config: DebridConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .map_err(|err| ProviderError::Transient(err.to_string()))?;
        let limiter = Arc::new(RateLimiter::new(config.rate_per_sec, config.rate_burst));
        let unlock_permits = Arc::new(Semaphore::new(config.unlock_concurrency.max(1) as usize));
        Ok(Self {
            http,
            config,
            limiter,
            unlock_permits,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn auth_params(&self) -> [(&'static str, String); 2] {
        [
            ("agent", self.config.agent.clone()),
            ("apikey", self.config.api_key.clone()),
        ]
    }

    /// Issue a request and unwrap the `{status, data}` envelope.
    async fn call(&self, request: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        self.limiter.acquire().await;
        let response = request.send().await?;
        let http_status = response.status();
        if http_status.as_u16() == 429 {
            return Err(ProviderError::Transient("provider rate limit hit".to_owned()));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::Transient(format!("malformed provider response: {err}")))?;
        if body.get("status").and_then(Value::as_str) == Some("success") {
            return Ok(body.get("data").cloned().unwrap_or(Value::Null));
        }
        Err(classify_error(&body, http_status.as_u16()))
    }

    async fn get(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let mut query: Vec<(String, String)> = self
            .auth_params()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        for (k, v) in params {
            query.push(((*k).to_owned(), (*v).to_owned()));
        }
        self.call(self.http.get(self.url(path)).query(&query)).await
    }

    async fn post_form(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, ProviderError> {
        let mut form: Vec<(String, String)> = self
            .auth_params()
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v))
            .collect();
        for (k, v) in params {
            form.push(((*k).to_owned(), (*v).to_owned()));
        }
        self.call(self.http.post(self.url(path)).form(&form)).await
    }

    async fn magnet_status(&self, magnet_id: &str) -> Result<ProviderPoll, ProviderError> {
        let data = self.get("/magnet/status", &[("id", magnet_id)]).await?;
        let magnet = match data.get("magnets") {
            Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };

        if let Some(error) = magnet.get("error") {
            let code = error
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("magnet_error");
            let message = error.get("message").and_then(Value::as_str).unwrap_or(code);
            return Ok(ProviderPoll {
                files: Vec::new(),
                terminal_error: Some(format!("{code}: {message}")),
            });
        }

        let mut files = Vec::new();
        for key in ["files", "links"] {
            if files.is_empty() {
                if let Some(Value::Array(items)) = magnet.get(key) {
                    normalize_entries(items, &mut files);
                }
            }
        }
        // older payloads report the arrays at the top level
        for key in ["files", "links"] {
            if files.is_empty() {
                if let Some(Value::Array(items)) = data.get(key) {
                    normalize_entries(items, &mut files);
                }
            }
        }
        debug!(magnet_id, count = files.len(), "magnet status poll");
        Ok(ProviderPoll {
            files,
            terminal_error: None,
        })
    }

    async fn link_status(&self, link: &str) -> Result<ProviderPoll, ProviderError> {
        let data = self.get("/link/infos", &[("link", link)]).await?;
        let infos = match data.get("infos") {
            Some(Value::Array(items)) => items.first().cloned().unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => Value::Null,
        };
        let name = infos
            .get("filename")
            .and_then(Value::as_str)
            .unwrap_or("download")
            .to_owned();
        let size = infos
            .get("filesize")
            .and_then(Value::as_u64)
            .unwrap_or_default();
        Ok(ProviderPoll {
            files: vec![ProviderFile {
                name,
                size,
                locked_url: Some(link.to_owned()),
            }],
            terminal_error: None,
        })
    }
}

#[async_trait]
impl ProviderClient for DebridClient {
    async fn upload(&self, source: &str) -> Result<String, ProviderError> {
        if !source.starts_with("magnet:") {
            // direct links need no provider-side registration; the link
            // itself is the reference
            return Ok(format!("{LINK_REF_PREFIX}{source}"));
        }
        let data = self
            .post_form("/magnet/upload", &[("magnets[]", source)])
            .await?;
        let id = data
            .get("magnets")
            .and_then(Value::as_array)
            .and_then(|magnets| magnets.first())
            .and_then(|magnet| magnet.get("id"))
            .map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .ok_or_else(|| {
                ProviderError::Transient("magnet upload returned no id".to_owned())
            })?;
        Ok(id)
    }

    async fn status(&self, provider_ref: &str) -> Result<ProviderPoll, ProviderError> {
        if let Some(link) = provider_ref.strip_prefix(LINK_REF_PREFIX) {
            self.link_status(link).await
        } else {
            self.magnet_status(provider_ref).await
        }
    }

    async fn unlock(&self, locked_url: &str) -> Result<String, ProviderError> {
        let _permit = self
            .unlock_permits
            .acquire()
            .await
            .map_err(|_| ProviderError::Transient("unlock semaphore closed".to_owned()))?;
        let data = self.get("/link/unlock", &[("link", locked_url)]).await?;
        for key in ["link", "download", "url"] {
            if let Some(direct) = data.get(key).and_then(Value::as_str) {
                if direct.starts_with("http") {
                    return Ok(direct.to_owned());
                }
            }
        }
        Err(ProviderError::Transient(
            "unlock returned no direct url".to_owned(),
        ))
    }
}

/// Flatten provider manifest entries into [`ProviderFile`] values.
///
/// Handles the abbreviated `{n, s, l}` shape, nested `e` directories,
/// and the long-form `{name|filename, size|filesize, link|url}` shape.
fn normalize_entries(items: &[Value], out: &mut Vec<ProviderFile>) {
    for item in items {
        if let Some(Value::Array(nested)) = item.get("e") {
            normalize_entries(nested, out);
            continue;
        }
        let name = ["n", "name", "filename"]
            .iter()
            .find_map(|key| item.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned();
        let size = ["s", "size", "filesize"]
            .iter()
            .find_map(|key| item.get(*key).and_then(Value::as_u64))
            .unwrap_or_default();
        let locked_url = ["l", "link", "url"]
            .iter()
            .find_map(|key| item.get(*key).and_then(Value::as_str))
            .map(str::to_owned);
        out.push(ProviderFile {
            name,
            size,
            locked_url,
        });
    }
}

fn classify_error(body: &Value, http_status: u16) -> ProviderError {
    let error = body.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(Value::as_str)
        .unwrap_or("");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("provider call failed");
    let detail = if code.is_empty() {
        format!("{message} (http {http_status})")
    } else {
        format!("{code}: {message}")
    };
    if TERMINAL_CODES.contains(&code) {
        ProviderError::Terminal(detail)
    } else {
        ProviderError::Transient(detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> DebridClient {
        DebridClient::new(DebridConfig {
            base_url: server.uri(),
            api_key: "test-key".to_owned(),
            agent: "hauler-test".to_owned(),
            rate_per_sec: 1_000.0,
            rate_burst: 100,
            ..DebridConfig::default()
        })
        .expect("client builds")
    }

    #[tokio::test]
    async fn upload_magnet_returns_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/magnet/upload"))
            .and(body_string_contains("magnets%5B%5D=magnet"))
            .and(body_string_contains("apikey=test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "magnets": [ { "id": 12345, "name": "demo" } ] }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let id = client.upload("magnet:?xt=urn:btih:abc").await.unwrap();
        assert_eq!(id, "12345");
    }

    #[tokio::test]
    async fn upload_link_is_local() {
        let server = MockServer::start().await;
        let client = client_for(&server);
        let id = client.upload("https://example.com/file.iso").await.unwrap();
        assert_eq!(id, "link:https://example.com/file.iso");
    }

    #[tokio::test]
    async fn status_normalizes_nested_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/magnet/status"))
            .and(query_param("id", "77"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "magnets": {
                    "id": 77,
                    "files": [
                        { "n": "folder", "e": [
                            { "n": "a.bin", "s": 1024, "l": "locked://a" },
                            { "n": "b.bin", "s": 2048, "l": "locked://b" }
                        ]},
                        { "name": "c.bin", "size": 512, "link": "locked://c" }
                    ]
                }}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let poll = client.status("77").await.unwrap();
        assert!(poll.terminal_error.is_none());
        assert_eq!(poll.files.len(), 3);
        assert_eq!(poll.files[0].name, "a.bin");
        assert_eq!(poll.files[0].size, 1024);
        assert_eq!(poll.files[0].locked_url.as_deref(), Some("locked://a"));
        assert_eq!(poll.files[2].name, "c.bin");
    }

    #[tokio::test]
    async fn status_reports_terminal_magnet_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/magnet/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "magnets": {
                    "id": 9,
                    "error": { "code": "magnet_dead", "message": "no peers" }
                }}
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let poll = client.status("9").await.unwrap();
        assert!(poll.files.is_empty());
        let error = poll.terminal_error.unwrap();
        assert!(error.contains("magnet_dead"));
    }

    #[tokio::test]
    async fn status_with_empty_manifest_is_not_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/magnet/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "magnets": { "id": 9, "status": "Downloading" } }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let poll = client.status("9").await.unwrap();
        assert!(poll.files.is_empty());
        assert!(poll.terminal_error.is_none());
    }

    #[tokio::test]
    async fn unlock_returns_direct_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/link/unlock"))
            .and(query_param("link", "locked://a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "link": "https://dl.example/a.bin" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let direct = client.unlock("locked://a").await.unwrap();
        assert_eq!(direct, "https://dl.example/a.bin");
    }

    #[tokio::test]
    async fn envelope_errors_classify_by_code() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/link/unlock"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "error": { "code": "LINK_DOWN", "message": "file removed" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.unlock("locked://gone").await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("LINK_DOWN"));
    }

    #[tokio::test]
    async fn unknown_envelope_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/magnet/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "error",
                "error": { "code": "MAINTENANCE", "message": "try later" }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.upload("magnet:?xt=urn:btih:abc").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn link_status_reports_single_file() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/link/infos"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "success",
                "data": { "infos": [ { "filename": "big.iso", "filesize": 4096 } ] }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let poll = client.status("link:https://example.com/big.iso").await.unwrap();
        assert_eq!(poll.files.len(), 1);
        assert_eq!(poll.files[0].name, "big.iso");
        assert_eq!(poll.files[0].size, 4096);
        assert_eq!(
            poll.files[0].locked_url.as_deref(),
            Some("https://example.com/big.iso")
        );
    }
}
