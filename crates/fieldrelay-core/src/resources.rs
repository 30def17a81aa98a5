//! Server resource API client
//!
//! Authenticated HTTP requests against the server's REST API: files,
//! folders, sequences, REST messages and PIN provisioning. Server errors
//! (5xx) and network failures are retried with a fixed delay; client errors
//! (4xx) are returned immediately.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::messages::build_auth_code;
use crate::messages::transport::is_local_server;

/// Resource API path prefix
pub const RESOURCES_PATH: &str = "/api/v1/resources";

/// Form parameters of a request
pub type Params = Vec<(String, String)>;

/// Resource type codes used by the server
pub mod resource_type {
    /// Folder
    pub const FOLDER: u32 = 10;
    /// Plain file
    pub const FILE: u32 = 20;
    /// Sequence of timestamped values
    pub const SEQUENCE: u32 = 21;
}

/// Errors from the resource API
#[derive(Error, Debug)]
pub enum ApiError {
    /// Server answered with an error status
    #[error("API error; status: {status}, reason: {reason}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Status reason phrase
        reason: String,
        /// Response body
        body: String,
    },

    /// Request could not be sent or read
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Response body was not what the call expects
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// HTTP status of a rejected request
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// How failed requests are retried
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    /// Pause between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 100,
            delay: Duration::from_secs(10),
        }
    }
}

/// Response of `POST /api/v1/pins`
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PinRequest {
    /// PIN shown to the user
    pub pin: u64,
    /// Code used to check on the PIN
    pub pin_code: String,
}

/// Credentials issued once a PIN has been entered on the server
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ControllerKey {
    /// Key for all later requests
    pub secret_key: String,
    /// Folder of this controller on the server
    #[serde(default)]
    pub controller_path: String,
}

/// Client for the server's resource API
pub struct ResourceClient {
    client: reqwest::Client,
    base_url: String,
    user_name: String,
    secret_key: RwLock<String>,
    old_auth: bool,
    retry: RetryPolicy,
    own_path: OnceCell<String>,
}

impl ResourceClient {
    /// Create a client for `server_name` (host or host:port)
    pub fn new(server_name: &str, secure: bool, user_name: impl Into<String>) -> Self {
        let scheme = if secure && !is_local_server(server_name) {
            "https"
        } else {
            "http"
        };
        let client = reqwest::Client::builder()
            .user_agent(concat!("FieldRelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: format!("{}://{}", scheme, server_name),
            user_name: user_name.into(),
            // a placeholder until a key is provisioned
            secret_key: RwLock::new("x".to_string()),
            old_auth: false,
            retry: RetryPolicy::default(),
            own_path: OnceCell::new(),
        }
    }

    /// Create a client from controller configuration
    pub fn from_config(config: &Config, user_name: impl Into<String>) -> Self {
        let server_name = config.get_str("server_name").unwrap_or("localhost");
        let secure = config.get_bool("secure_server", true);
        let client = Self::new(server_name, secure, user_name).with_old_auth(config.get_bool("old_auth", false));
        match config.get_str("secret_key") {
            Some(key) if !key.is_empty() => client.set_secret_key(key),
            _ => tracing::info!("no secret key in config"),
        }
        client
    }

    /// Authenticate with an auth code instead of basic auth
    pub fn with_old_auth(mut self, old_auth: bool) -> Self {
        self.old_auth = old_auth;
        self
    }

    /// Use a different retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// `http(s)://<server>`
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Replace the secret key (after provisioning)
    pub fn set_secret_key(&self, key: &str) {
        *self.secret_key.write().unwrap_or_else(|e| e.into_inner()) = key.to_string();
    }

    fn secret_key(&self) -> String {
        self.secret_key.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Send an authenticated request, retrying server and network errors
    pub async fn send_request(
        &self,
        method: Method,
        path: &str,
        params: Params,
    ) -> Result<Vec<u8>, ApiError> {
        self.request(method, path, params, false).await
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        mut params: Params,
        binary: bool,
    ) -> Result<Vec<u8>, ApiError> {
        if self.old_auth {
            params.push(("authCode".into(), build_auth_code(&self.secret_key())));
        }

        let mut retries = 0;
        loop {
            let failure = match self.send_once(&method, path, &params, binary).await {
                Ok((status, body)) if status.is_success() => return Ok(body),
                Ok((status, body)) => {
                    if status.as_u16() < 500 || retries >= self.retry.max_retries {
                        return Err(ApiError::Status {
                            status: status.as_u16(),
                            reason: status.canonical_reason().unwrap_or("").to_string(),
                            body: String::from_utf8_lossy(&body).into_owned(),
                        });
                    }
                    status.to_string()
                }
                Err(e) => {
                    if retries >= self.retry.max_retries {
                        return Err(e.into());
                    }
                    tracing::debug!("request error: {}", e);
                    e.to_string()
                }
            };

            tracing::info!("retrying {} {}; error: {}", method, path, failure);
            tokio::time::sleep(self.retry.delay).await;
            retries += 1;
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        params: &Params,
        binary: bool,
    ) -> Result<(reqwest::StatusCode, Vec<u8>), reqwest::Error> {
        let url = format!("{}{}", self.base_url, path);
        let accept = if binary {
            "application/octet-stream"
        } else {
            "text/plain"
        };
        let mut builder = self.client.request(method.clone(), url).header(ACCEPT, accept);
        builder = if *method == Method::GET {
            builder.query(params)
        } else {
            builder.form(params)
        };
        if !self.old_auth {
            builder = builder.basic_auth(&self.user_name, Some(self.secret_key()));
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body.to_vec()))
    }

    async fn request_json(&self, method: Method, path: &str, params: Params) -> Result<Value, ApiError> {
        let body = self.send_request(method, path, params).await?;
        serde_json::from_slice(&body).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// List the contents of a folder
    pub async fn list(
        &self,
        dir_path: &str,
        recursive: bool,
        type_filter: Option<&str>,
        extended: bool,
    ) -> Result<Value, ApiError> {
        let mut params = vec![("extended".to_string(), (extended as u8).to_string())];
        if recursive {
            params.push(("recursive".into(), "1".into()));
        }
        if let Some(t) = type_filter {
            params.push(("type".into(), t.to_string()));
        }
        self.request_json(Method::GET, &resource_path(dir_path), params).await
    }

    /// Whether a resource exists; other errors are returned
    pub async fn exists(&self, path: &str) -> Result<bool, ApiError> {
        let params = vec![("meta".to_string(), "1".to_string())];
        match self.send_request(Method::GET, &resource_path(path), params).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resource metadata
    pub async fn info(&self, path: &str) -> Result<Value, ApiError> {
        let params = vec![
            ("meta".to_string(), "1".to_string()),
            ("include_path".to_string(), "1".to_string()),
        ];
        self.request_json(Method::GET, &resource_path(path), params).await
    }

    /// This controller's folder on the server; looked up once, then cached
    pub async fn own_path(&self) -> Result<String, ApiError> {
        self.own_path
            .get_or_try_init(|| async {
                let info = self.info("/self").await?;
                info.get("path")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| ApiError::InvalidResponse("missing path in /self".into()))
            })
            .await
            .cloned()
    }

    /// Record this controller's folder when it is already known (provisioning)
    pub fn set_own_path(&self, path: &str) {
        if !path.is_empty() {
            let _ = self.own_path.set(path.to_string());
        }
    }

    /// Resource contents
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        self.request(Method::GET, &resource_path(path), Vec::new(), true)
            .await
    }

    /// Write a file; with `new_version` an existing file gets a new revision
    pub async fn write(
        &self,
        path: &str,
        contents: &[u8],
        modified: Option<DateTime<Utc>>,
        new_version: bool,
    ) -> Result<(), ApiError> {
        let mut params = vec![("data".to_string(), STANDARD.encode(contents))];
        if let Some(ts) = modified {
            params.push(("modificationTimestamp".into(), server_timestamp(ts)));
        }

        if !new_version {
            self.send_request(Method::POST, &resource_path(path), params)
                .await?;
            return Ok(());
        }

        if self.exists(path).await? {
            self.send_request(Method::PUT, &resource_path(path), params)
                .await?;
        } else {
            let (parent, name) = split_path(path);
            params.push(("path".into(), parent.to_string()));
            params.push(("name".into(), name.to_string()));
            params.push(("type".into(), resource_type::FILE.to_string()));
            self.send_request(Method::POST, RESOURCES_PATH, params).await?;
        }
        Ok(())
    }

    /// Create a folder (and any missing parents)
    pub async fn create_folder(&self, folder_path: &str) -> Result<(), ApiError> {
        let (parent, name) = split_path(folder_path);
        let params = vec![
            ("path".to_string(), parent.to_string()),
            ("name".to_string(), name.to_string()),
            ("type".to_string(), resource_type::FOLDER.to_string()),
        ];
        self.send_request(Method::POST, RESOURCES_PATH, params).await?;
        Ok(())
    }

    /// Move a resource under a new parent folder
    pub async fn move_to(&self, path: &str, new_parent: &str) -> Result<(), ApiError> {
        let params = vec![("parent".to_string(), new_parent.to_string())];
        self.send_request(Method::PUT, &resource_path(path), params)
            .await?;
        Ok(())
    }

    /// Send a message to a folder through the REST API
    pub async fn send_message(
        &self,
        folder_path: &str,
        message_type: &str,
        parameters: &Value,
    ) -> Result<(), ApiError> {
        let params = vec![
            ("folder_path".to_string(), folder_path.to_string()),
            ("type".to_string(), message_type.to_string()),
            ("parameters".to_string(), parameters.to_string()),
        ];
        self.send_request(Method::POST, "/api/v1/messages", params)
            .await?;
        Ok(())
    }

    /// Ask the server for a provisioning PIN
    pub async fn request_pin(&self) -> Result<PinRequest, ApiError> {
        let value = self.request_json(Method::POST, "/api/v1/pins", Vec::new()).await?;
        serde_json::from_value(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }

    /// Check whether a PIN has been entered; returns the key once it has
    pub async fn check_pin(&self, pin: &PinRequest) -> Result<Option<ControllerKey>, ApiError> {
        let params = vec![("pin_code".to_string(), pin.pin_code.clone())];
        let value = self
            .request_json(Method::GET, &format!("/api/v1/pins/{}", pin.pin), params)
            .await?;
        if value.get("secret_key").is_none() {
            return Ok(None);
        }
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

impl std::fmt::Debug for ResourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceClient")
            .field("base_url", &self.base_url)
            .field("user_name", &self.user_name)
            .field("old_auth", &self.old_auth)
            .finish_non_exhaustive()
    }
}

/// URL path of a resource; spaces are escaped
pub fn resource_path(path: &str) -> String {
    format!("{}{}", RESOURCES_PATH, path.replace(' ', "%20"))
}

/// Split `/a/b/c` into (`/a/b`, `c`)
pub fn split_path(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(pos) => (&path[..pos], &path[pos + 1..]),
        None => ("", path),
    }
}

/// Timestamp in the form the server expects (`2024-05-01T12:00:00.000000 Z`)
pub fn server_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f Z").to_string()
}
