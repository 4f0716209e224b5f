//! Control-plane REST client.
//!
//! Every call goes through one retry loop that classifies each attempt
//! outcome: auth failures and missing endpoints are fatal immediately,
//! throttling retries on a quadratic curve, server errors and transport
//! failures retry linearly, and envelope-level failures are business errors
//! that never retry.

use std::collections::BTreeMap;
#[cfg(any(target_os = "macos", target_os = "windows"))]
use std::process::Command;
use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::retry::{retry_async, RequestBackoff};
use crate::tls;

const USER_AGENT: &str = concat!("mcpproxy-sdk/", env!("CARGO_PKG_VERSION"));

/// Errors produced by API transport, classification, and decoding.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level failure; retried with linear backoff.
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// 401 response; never retried.
    #[error("authentication failed: invalid or missing API key")]
    Auth,

    /// 403 response; never retried.
    #[error("authorization failed: insufficient permissions")]
    Forbidden,

    /// 404 response; never retried.
    #[error("endpoint not found: {path}")]
    NotFound {
        /// Path of the missing endpoint.
        path: String,
    },

    /// 429 response; retried with quadratic backoff until exhausted.
    #[error("rate limited after {attempts} attempts")]
    Throttled {
        /// Attempts performed when the error was produced.
        attempts: usize,
    },

    /// 5xx response; retried with linear backoff until exhausted.
    #[error("server error after {attempts} attempts: status {status}")]
    Server {
        /// Attempts performed when the error was produced.
        attempts: usize,
        /// Status of the last response.
        status: StatusCode,
    },

    /// Any other non-2xx response; never retried.
    #[error("API call failed with status {status}")]
    Status {
        /// Status of the response.
        status: StatusCode,
    },

    /// 2xx response whose body does not decode into the envelope.
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    /// Envelope decoded but reported `success: false`.
    #[error("API error: {0}")]
    Envelope(String),

    /// Launching the platform browser failed.
    #[error("failed to open the web console: {0}")]
    Browser(std::io::Error),

    /// Host platform has no supported document-open facility.
    #[error("unsupported platform for opening the web console: {os}")]
    Capability {
        /// Host operating system name.
        os: &'static str,
    },
}

/// Standard response envelope for all control-plane endpoints.
#[derive(Debug, Deserialize)]
struct Envelope {
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Upstream server entry from the servers listing.
///
/// Fields the proxy omits decode to their zero values.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ServerEntry {
    /// Configured server name.
    #[serde(default)]
    pub name: String,
    /// Whether the upstream connection is established.
    #[serde(default)]
    pub connected: bool,
    /// Whether a connection attempt is in flight.
    #[serde(default)]
    pub connecting: bool,
    /// Whether the server is enabled in configuration.
    #[serde(default)]
    pub enabled: bool,
    /// Whether the server is quarantined.
    #[serde(default)]
    pub quarantined: bool,
    /// Upstream protocol identifier.
    #[serde(default)]
    pub protocol: String,
    /// Upstream URL for remote servers.
    #[serde(default)]
    pub url: String,
    /// Launch command for local servers.
    #[serde(default)]
    pub command: String,
    /// Number of tools the server exposes.
    #[serde(default)]
    pub tool_count: i64,
    /// Last connection error, empty when healthy.
    #[serde(default)]
    pub last_error: String,
}

/// Tool entry from the per-server tool listing.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct ToolEntry {
    /// Tool name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Owning server name.
    #[serde(default)]
    pub server: String,
    /// JSON schema of the tool input, when reported.
    #[serde(default)]
    pub input_schema: Option<BTreeMap<String, Value>>,
}

/// Scored entry from the tool search index.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct SearchEntry {
    /// Tool name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Owning server name.
    #[serde(default)]
    pub server: String,
    /// Relevance score.
    #[serde(default)]
    pub score: f64,
    /// JSON schema of the tool input, when reported.
    #[serde(default)]
    pub input_schema: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
struct ServersData {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolsData {
    #[serde(default)]
    tools: Vec<ToolEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct SearchData {
    #[serde(default)]
    results: Vec<SearchEntry>,
}

/// Client for the control-plane REST API.
///
/// Stateless across calls; safe to clone and use concurrently with a
/// running stream supervisor on the same transport.
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    api_key: Option<SecretString>,
    backoff: RequestBackoff,
}

impl ApiClient {
    /// Creates an API client over its own transport.
    ///
    /// The transport trusts the locally issued proxy CA in addition to the
    /// system store (see [`crate::tls`]).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self::with_http(tls::build_http_client()?, base_url))
    }

    /// Creates an API client over an existing transport.
    pub fn with_http(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http,
            base_url,
            api_key: None,
            backoff: RequestBackoff::default(),
        }
    }

    /// Sets the API key sent as the `X-API-Key` header.
    pub fn with_api_key(mut self, api_key: SecretString) -> Self {
        self.api_key = Some(api_key);
        self
    }

    /// Overrides the per-call retry policy.
    pub fn with_backoff(mut self, backoff: RequestBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Lists configured upstream servers.
    pub async fn get_servers(&self) -> Result<Vec<ServerEntry>, ApiError> {
        let envelope = self.execute(Method::GET, "/api/v1/servers").await?;
        let data: ServersData = decode_data(envelope.data)?;
        Ok(data.servers)
    }

    /// Enables or disables an upstream server.
    pub async fn enable_server(&self, server_name: &str, enabled: bool) -> Result<(), ApiError> {
        let action = if enabled { "enable" } else { "disable" };
        let path = format!("/api/v1/servers/{server_name}/{action}");
        self.execute(Method::POST, &path).await.map(drop)
    }

    /// Restarts an upstream server.
    pub async fn restart_server(&self, server_name: &str) -> Result<(), ApiError> {
        let path = format!("/api/v1/servers/{server_name}/restart");
        self.execute(Method::POST, &path).await.map(drop)
    }

    /// Triggers the OAuth login flow for an upstream server.
    pub async fn trigger_oauth_login(&self, server_name: &str) -> Result<(), ApiError> {
        let path = format!("/api/v1/servers/{server_name}/login");
        self.execute(Method::POST, &path).await.map(drop)
    }

    /// Lists the tools of one upstream server.
    pub async fn get_server_tools(&self, server_name: &str) -> Result<Vec<ToolEntry>, ApiError> {
        let path = format!("/api/v1/servers/{server_name}/tools");
        let envelope = self.execute(Method::GET, &path).await?;
        let data: ToolsData = decode_data(envelope.data)?;
        Ok(data.tools)
    }

    /// Searches the tool index.
    pub async fn search_tools(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SearchEntry>, ApiError> {
        let path = format!("/api/v1/index/search?q={query}&limit={limit}");
        let envelope = self.execute(Method::GET, &path).await?;
        let data: SearchData = decode_data(envelope.data)?;
        Ok(data.results)
    }

    /// Opens the proxy web console in the platform browser.
    ///
    /// The credential travels as an `apikey` query parameter because the
    /// console is opened by an external browser process, not through this
    /// client's transport.
    pub fn open_web_console(&self) -> Result<(), ApiError> {
        let mut url = format!("{}/ui/", self.base_url);
        if let Some(api_key) = self.api_key.as_ref() {
            url.push_str("?apikey=");
            url.push_str(api_key.expose_secret());
        }

        info!(event = "open_web_console", base_url = %self.base_url);
        open_in_browser(&url)
    }

    async fn execute(&self, method: Method, path: &str) -> Result<Envelope, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let backoff = self.backoff.clone();

        retry_async(
            backoff.max_attempts,
            |attempt| {
                let method = method.clone();
                let url = url.clone();
                async move { self.send_attempt(method, &url, path, attempt).await }
            },
            |error, attempt| retry_delay(error, attempt, &backoff),
        )
        .await
    }

    async fn send_attempt(
        &self,
        method: Method,
        url: &str,
        path: &str,
        attempt: usize,
    ) -> Result<Envelope, ApiError> {
        let mut builder = self
            .http
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT);

        if let Some(api_key) = self.api_key.as_ref() {
            builder = builder.header("X-API-Key", api_key.expose_secret());
        }

        let response = builder.send().await?;
        let status = response.status();

        // Every error path drops the response before the retry sleep, so the
        // connection is released before the next attempt opens a new one.
        match status.as_u16() {
            401 => return Err(ApiError::Auth),
            403 => return Err(ApiError::Forbidden),
            404 => {
                return Err(ApiError::NotFound {
                    path: path.to_string(),
                })
            }
            429 => return Err(ApiError::Throttled { attempts: attempt }),
            500 | 502 | 503 | 504 => {
                return Err(ApiError::Server {
                    attempts: attempt,
                    status,
                })
            }
            _ => {}
        }

        if !status.is_success() {
            return Err(ApiError::Status { status });
        }

        let body = response.text().await?;
        decode_envelope(&body)
    }
}

/// Classifies an attempt error into a retry delay.
///
/// `None` means the error is fatal now; `Some` schedules another attempt
/// until the policy's budget is exhausted.
fn retry_delay(error: &ApiError, attempt: usize, backoff: &RequestBackoff) -> Option<Duration> {
    let delay = match error {
        ApiError::Transport(_) | ApiError::Server { .. } => backoff.linear(attempt),
        ApiError::Throttled { .. } => backoff.quadratic(attempt),
        _ => return None,
    };

    if attempt < backoff.max_attempts {
        warn!(
            event = "api_call_retrying",
            attempt,
            max_attempts = backoff.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
        );
    }
    Some(delay)
}

fn decode_envelope(body: &str) -> Result<Envelope, ApiError> {
    let envelope: Envelope = serde_json::from_str(body)?;
    if !envelope.success {
        return Err(ApiError::Envelope(envelope.error.unwrap_or_default()));
    }
    Ok(envelope)
}

/// Decodes the envelope `data` payload, treating an absent payload as the
/// type's zero value.
fn decode_data<T>(data: Option<Value>) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    match data {
        Some(value) => Ok(serde_json::from_value(value)?),
        None => Ok(T::default()),
    }
}

#[cfg(target_os = "macos")]
fn open_in_browser(url: &str) -> Result<(), ApiError> {
    run_opener(Command::new("open").arg(url))
}

#[cfg(target_os = "windows")]
fn open_in_browser(url: &str) -> Result<(), ApiError> {
    if run_opener(Command::new("rundll32").args(["url.dll,FileProtocolHandler", url])).is_ok() {
        return Ok(());
    }
    run_opener(Command::new("cmd").args(["/c", "start", "", url]))
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn open_in_browser(_url: &str) -> Result<(), ApiError> {
    Err(ApiError::Capability {
        os: std::env::consts::OS,
    })
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn run_opener(command: &mut Command) -> Result<(), ApiError> {
    let status = command.status().map_err(ApiError::Browser)?;
    if status.success() {
        Ok(())
    } else {
        Err(ApiError::Browser(std::io::Error::other(format!(
            "opener exited with {status}"
        ))))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        decode_data, decode_envelope, retry_delay, ApiError, SearchData, ServerEntry, ServersData,
    };
    use crate::retry::RequestBackoff;

    #[test]
    fn envelope_success_with_data() {
        let body = r#"{"success":true,"data":{"servers":[]}}"#;
        let envelope = decode_envelope(body).expect("decode envelope");
        assert!(envelope.data.is_some());
    }

    #[test]
    fn envelope_failure_carries_business_error() {
        let body = r#"{"success":false,"error":"server not found"}"#;
        let error = decode_envelope(body).expect_err("failure envelope");
        match error {
            ApiError::Envelope(message) => assert_eq!(message, "server not found"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn malformed_envelope_is_a_decode_error() {
        let error = decode_envelope("not json").expect_err("malformed body");
        assert!(matches!(error, ApiError::Decode(_)));
    }

    #[test]
    fn server_entry_tolerates_missing_fields() {
        let data: ServersData = decode_data(Some(json!({
            "servers": [{"name": "fs", "connected": true}]
        })))
        .expect("decode servers");

        assert_eq!(
            data.servers,
            vec![ServerEntry {
                name: "fs".to_string(),
                connected: true,
                ..ServerEntry::default()
            }]
        );
    }

    #[test]
    fn absent_data_payload_decodes_to_default() {
        let data: SearchData = decode_data(None).expect("decode absent data");
        assert!(data.results.is_empty());
    }

    #[test]
    fn classification_retries_transport_and_server_errors_linearly() {
        let backoff = RequestBackoff {
            max_attempts: 3,
            base: Duration::from_secs(1),
        };
        let error = ApiError::Server {
            attempts: 2,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };

        assert_eq!(
            retry_delay(&error, 2, &backoff),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn classification_retries_throttling_quadratically() {
        let backoff = RequestBackoff {
            max_attempts: 3,
            base: Duration::from_secs(1),
        };
        let error = ApiError::Throttled { attempts: 2 };

        assert_eq!(
            retry_delay(&error, 2, &backoff),
            Some(Duration::from_secs(4))
        );
    }

    #[test]
    fn classification_marks_fatal_categories() {
        let backoff = RequestBackoff::default();

        for error in [
            ApiError::Auth,
            ApiError::Forbidden,
            ApiError::NotFound {
                path: "/api/v1/servers".to_string(),
            },
            ApiError::Status {
                status: StatusCode::IM_A_TEAPOT,
            },
            ApiError::Envelope("nope".to_string()),
        ] {
            assert_eq!(retry_delay(&error, 1, &backoff), None, "{error:?}");
        }
    }

    #[test]
    fn exhausted_server_error_names_the_attempt_count() {
        let error = ApiError::Server {
            attempts: 3,
            status: StatusCode::INTERNAL_SERVER_ERROR,
        };
        assert!(error.to_string().contains("after 3 attempts"));
    }
}
