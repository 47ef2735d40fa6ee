//! Transport layer for sync requests
//!
//! The engines talk to the annotation service through [`SyncTransport`],
//! a single JSON `PUT` primitive. [`HttpTransport`] is the production
//! implementation; tests substitute an in-memory service.

use crate::config::{ANNOTATION_SYNC_PATH, NOTEBOOK_SYNC_PATH};
use crate::error::{AppError, AuthFailure, Result, ServiceError};
use crate::services::{RetrySettings, SyncSettings};
use async_trait::async_trait;
use rand::Rng;
use reqwest::header::{ACCEPT, CONTENT_TYPE, COOKIE};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Service endpoint a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Notebook (folder) sync
    Notebooks,
    /// Annotation id probe and full fetch
    Annotations,
}

impl Endpoint {
    pub fn path(self) -> &'static str {
        match self {
            Endpoint::Notebooks => NOTEBOOK_SYNC_PATH,
            Endpoint::Annotations => ANNOTATION_SYNC_PATH,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Network primitive used by the sync engines
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Send `payload` to `endpoint` and return the decoded JSON response.
    async fn put(&self, endpoint: Endpoint, payload: Value) -> Result<Value>;
}

/// Body of a failed response
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errors: Vec<ServiceError>,
}

/// reqwest-backed transport with bounded retry
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    session_cookie: Option<String>,
    retry: RetrySettings,
}

impl HttpTransport {
    pub fn new(
        base_url: impl Into<String>,
        session_cookie: Option<String>,
        timeout: Duration,
        retry: RetrySettings,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("annosync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Generic(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_cookie,
            retry,
        })
    }

    pub fn from_settings(settings: &SyncSettings) -> Result<Self> {
        let base_url = settings
            .server_url
            .clone()
            .ok_or_else(|| AppError::Validation("no server_url configured".into()))?;

        Self::new(
            base_url,
            settings.session_cookie.clone(),
            settings.request_timeout(),
            settings.retry.clone(),
        )
    }

    fn url(&self, endpoint: Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path())
    }

    async fn put_once(&self, endpoint: Endpoint, payload: &Value) -> Result<Value> {
        let mut request = self
            .client
            .put(self.url(endpoint))
            .header(ACCEPT, "application/json")
            .header(CONTENT_TYPE, "application/json")
            .json(payload);
        if let Some(cookie) = &self.session_cookie {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        // Error bodies are best effort; an unreadable one just has no details.
        let body: ErrorBody = response.json().await.unwrap_or_default();
        Err(status_error(status, body.errors))
    }
}

/// Map a non-success status onto the error taxonomy.
fn status_error(status: StatusCode, errors: Vec<ServiceError>) -> AppError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            AppError::Authentication(AuthFailure::from_errors(&errors))
        }
        _ => AppError::Service {
            status: status.as_u16(),
            errors,
        },
    }
}

/// Backoff before retry number `retry`, with up to 50% random jitter.
fn retry_delay(retry: &RetrySettings, attempt: u32) -> Duration {
    let base = retry.backoff(attempt);
    let jitter_ms = base.as_millis() as u64 / 2;
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn put(&self, endpoint: Endpoint, payload: Value) -> Result<Value> {
        let attempts = self.retry.attempts();
        let mut attempt = 1;

        loop {
            tracing::debug!("PUT {} (attempt {}/{})", endpoint, attempt, attempts);

            match self.put_once(endpoint, &payload).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = retry_delay(&self.retry, attempt);
                    tracing::warn!(
                        "Request to {} failed: {}. Retrying in {:?}",
                        endpoint,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Request to {} failed: {}", endpoint, e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(code: &str) -> ServiceError {
        ServiceError {
            code: Some(code.to_string()),
            message: None,
            id: None,
        }
    }

    #[test]
    fn test_auth_statuses_map_to_authentication() {
        let err = status_error(StatusCode::UNAUTHORIZED, vec![error("password_expired")]);
        assert!(matches!(
            err,
            AppError::Authentication(AuthFailure::PasswordExpired)
        ));

        let err = status_error(StatusCode::FORBIDDEN, vec![]);
        assert!(err.is_authentication());
    }

    #[test]
    fn test_other_statuses_map_to_service() {
        let err = status_error(StatusCode::BAD_REQUEST, vec![error("bad_since")]);
        assert!(matches!(err, AppError::Service { status: 400, .. }));
        assert!(!err.is_retryable());

        let err = status_error(StatusCode::SERVICE_UNAVAILABLE, vec![]);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retry_delay_within_jitter_bounds() {
        let retry = RetrySettings {
            max_attempts: 3,
            initial_delay_ms: 200,
            max_delay_ms: 1_000,
        };

        for _ in 0..20 {
            let delay = retry_delay(&retry, 2);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn test_url_joins_base_and_path() {
        let transport = HttpTransport::new(
            "https://example.org/",
            None,
            Duration::from_secs(5),
            RetrySettings::default(),
        )
        .unwrap();

        assert_eq!(
            transport.url(Endpoint::Notebooks),
            "https://example.org/annotations/v1/folders/sync"
        );
    }

    #[test]
    fn test_from_settings_requires_server() {
        let settings = SyncSettings::default();
        assert!(matches!(
            HttpTransport::from_settings(&settings),
            Err(AppError::Validation(_))
        ));
    }
}
