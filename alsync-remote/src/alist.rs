//! HTTP client for an Alist file service
//!
//! Every endpoint answers with a `{code, message, data}` envelope; the HTTP
//! status alone is not enough to tell success from failure.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::entry::{ListPage, RemoteEntry};
use crate::errors::{RemoteError, Result};
use crate::storage::RemoteStorage;

const USER_AGENT: &str = concat!("alsync/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
}

#[derive(Debug, Deserialize)]
struct MeData {
    #[serde(default)]
    username: String,
}

/// Map a non-success envelope to an error
fn classify(http_status: StatusCode, code: i64, message: &str) -> RemoteError {
    let http = i64::from(http_status.as_u16());
    let lowered = message.to_ascii_lowercase();

    if matches!(http, 401 | 403) || matches!(code, 401 | 403) {
        RemoteError::Unauthorized(format!("{}: {}", code, message))
    } else if http == 404 || code == 404 || lowered.contains("not found") {
        RemoteError::NotFound(message.to_string())
    } else if http / 100 == 5 || code / 100 == 5 {
        RemoteError::Server {
            code,
            message: message.to_string(),
        }
    } else {
        RemoteError::Request {
            code,
            message: message.to_string(),
        }
    }
}

pub struct AlistClient {
    http: Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl AlistClient {
    /// `base_url` is the API root, e.g. `https://host/api`
    pub fn new(base_url: &str) -> Result<Self> {
        Self::build(base_url, None)
    }

    pub fn with_token(base_url: &str, token: impl Into<String>) -> Result<Self> {
        Self::build(base_url, Some(token.into()))
    }

    fn build(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(token),
        })
    }

    /// Log in with username and password and keep the returned token
    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        let body = json!({
            "username": username,
            "password": password,
            "otp_code": "",
        });
        let data: LoginData = self.call(Method::POST, "/auth/login", Some(body)).await?;
        *self.token.write().await = Some(data.token);

        let me: MeData = self.call(Method::GET, "/me", None).await?;
        if me.username != username {
            warn!("Login as {} returned identity {:?}", username, me.username);
            return Err(RemoteError::Login(username.to_string()));
        }

        info!("Logged in to {} as {}", self.base_url, username);
        Ok(())
    }

    fn url(&self, api: &str) -> String {
        format!("{}{}", self.base_url, api)
    }

    async fn send(&self, request: reqwest::RequestBuilder, api: &str) -> Result<Value> {
        let request = match self.token.read().await.as_deref() {
            Some(token) => request.header("Authorization", token),
            None => request,
        };

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("Response {} [{}]: {}", api, status, text);

        let envelope: Envelope = serde_json::from_str(&text).map_err(|e| {
            if status.is_success() {
                RemoteError::BadResponse(format!("{}: {}", api, e))
            } else {
                classify(status, i64::from(status.as_u16()), &text)
            }
        })?;

        if status == StatusCode::OK && envelope.code == 200 {
            Ok(envelope.data.unwrap_or(Value::Null))
        } else {
            Err(classify(status, envelope.code, &envelope.message))
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        api: &str,
        body: Option<Value>,
    ) -> Result<T> {
        debug!("Request {} {} {:?}", method, api, body);
        let mut request = self.http.request(method, self.url(api));
        if let Some(body) = body {
            request = request.json(&body);
        }
        let data = self.send(request, api).await?;
        Ok(serde_json::from_value(data)?)
    }

    async fn call_unit(&self, api: &str, body: Value) -> Result<()> {
        let _: Value = self.call(Method::POST, api, Some(body)).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStorage for AlistClient {
    async fn list_page(&self, path: &str, page: u32, per_page: u32) -> Result<Vec<RemoteEntry>> {
        let body = json!({
            "path": path,
            "page": page,
            "per_page": per_page,
            "refresh": false,
        });
        let listing: Option<ListPage> = self.call(Method::POST, "/fs/list", Some(body)).await?;
        Ok(listing.and_then(|l| l.content).unwrap_or_default())
    }

    async fn get_metadata(&self, path: &str) -> Result<RemoteEntry> {
        let entry: Option<RemoteEntry> = self
            .call(Method::POST, "/fs/get", Some(json!({ "path": path })))
            .await
            .map_err(|e| match e {
                RemoteError::NotFound(message) => {
                    RemoteError::NotFound(format!("{} ({})", path, message))
                }
                other => other,
            })?;
        entry.ok_or_else(|| RemoteError::NotFound(path.to_string()))
    }

    async fn make_dir(&self, path: &str) -> Result<()> {
        self.call_unit("/fs/mkdir", json!({ "path": path })).await
    }

    async fn move_entry(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()> {
        self.call_unit(
            "/fs/move",
            json!({ "src_dir": src_dir, "dst_dir": dst_dir, "names": names }),
        )
        .await
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<()> {
        self.call_unit("/fs/rename", json!({ "path": path, "name": new_name }))
            .await
    }

    async fn copy(&self, src_dir: &str, dst_dir: &str, names: &[String]) -> Result<()> {
        self.call_unit(
            "/fs/copy",
            json!({ "src_dir": src_dir, "dst_dir": dst_dir, "names": names }),
        )
        .await
    }

    async fn create_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let request = self
            .http
            .put(self.url("/fs/put"))
            .header("File-Path", urlencoding::encode(path).into_owned())
            .header("Content-Type", "application/octet-stream")
            .body(data);
        self.send(request, "/fs/put").await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("alist({})", self.base_url)
    }
}
