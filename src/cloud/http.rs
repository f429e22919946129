use crate::error::{Result, SetupError};
use google_cloud_auth::credentials::{AccessTokenCredentials, Builder};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// What a request is for; decides how error statuses are mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Describe,
    Create,
    Update,
}

/// Authenticated JSON client for the Google REST APIs.
pub struct GcpClient {
    http: reqwest::Client,
    credentials: AccessTokenCredentials,
}

impl GcpClient {
    /// Authenticates with Application Default Credentials.
    pub fn connect(request_timeout: Duration) -> Result<Self> {
        debug!("authenticating using Application Default Credentials");
        let credentials = Builder::default()
            .with_scopes([CLOUD_PLATFORM_SCOPE])
            .build_access_token_credentials()
            .map_err(|e| SetupError::Auth(e.to_string()))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rootstrap/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http, credentials })
    }

    async fn bearer(&self) -> Result<String> {
        let token = self
            .credentials
            .access_token()
            .await
            .map_err(|e| SetupError::Auth(e.to_string()))?;
        Ok(token.token)
    }

    /// GET that maps 404 to `None`.
    pub async fn fetch(&self, url: Url) -> Result<Option<Value>> {
        self.request(Method::GET, url, None, Intent::Describe).await
    }

    /// POST used to read (getIamPolicy); 404 maps to `None`.
    pub async fn fetch_with(&self, url: Url, body: &Value) -> Result<Option<Value>> {
        self.request(Method::POST, url, Some(body), Intent::Describe).await
    }

    /// A write call; a 404 is an error here.
    pub async fn call(&self, method: Method, url: Url, body: Option<&Value>, intent: Intent) -> Result<Value> {
        let resource = url.path().to_string();
        self.request(method, url, body, intent)
            .await?
            .ok_or_else(|| SetupError::api(404, format!("{} not found", resource)))
    }

    async fn request(&self, method: Method, url: Url, body: Option<&Value>, intent: Intent) -> Result<Option<Value>> {
        debug!(method = %method, url = %url, "calling API");
        let resource = url.path().trim_start_matches('/').to_string();
        let mut builder = self.http.request(method, url).bearer_auth(self.bearer().await?);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let res = builder.send().await?;
        let status = res.status();
        let text = res.text().await?;

        if status.is_success() {
            if text.trim().is_empty() {
                return Ok(Some(Value::Object(Default::default())));
            }
            return Ok(Some(serde_json::from_str(&text)?));
        }
        if status == StatusCode::NOT_FOUND && intent == Intent::Describe {
            return Ok(None);
        }
        Err(map_status(status, intent, resource, error_message(&text)))
    }
}

/// Extracts `error.message` from a Google error payload, else the raw text.
fn error_message(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.pointer("/error/message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| text.trim().to_string())
}

pub(crate) fn map_status(status: StatusCode, intent: Intent, resource: String, message: String) -> SetupError {
    match (status.as_u16(), intent) {
        (403, _) => SetupError::PermissionDenied(format!("{}: {}", resource, message)),
        (409, Intent::Create) => SetupError::AlreadyExists { resource },
        (409 | 412, Intent::Update) => SetupError::ConcurrentModification { resource },
        (408 | 504, _) => SetupError::Timeout(format!("{}: {}", resource, message)),
        (code, _) => SetupError::Api { status: code, message },
    }
}

/// Builds `base/path` with optional query parameters.
pub(crate) fn endpoint(base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url> {
    let raw = format!("{}/{}", base, path.trim_start_matches('/'));
    let url = if params.is_empty() {
        Url::parse(&raw)
    } else {
        Url::parse_with_params(&raw, params)
    };
    url.map_err(|e| SetupError::Config(format!("invalid URL '{}': {}", raw, e)))
}
