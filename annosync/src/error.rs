//! Error types for the annotation store and sync engine
//!
//! All errors use thiserror for structured error handling.
//! Variants follow the failure classes callers need to tell apart:
//! contract violations, validation, remote payload problems,
//! transport/service failures and authentication.

use crate::database::{Status, TransactionKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cannot start a {requested} transaction while a {active} transaction is active")]
    TransactionConflict {
        active: TransactionKind,
        requested: TransactionKind,
    },

    #[error("Invalid status transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: Status,
        to: Status,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Annotation not found: {0}")]
    AnnotationNotFound(String),

    #[error("Notebook not found: {0}")]
    NotebookNotFound(String),

    #[error("Malformed remote change: {0}")]
    Deserialization(String),

    #[error("Service returned status {status}: {}", ServiceError::join(.errors))]
    Service {
        status: u16,
        errors: Vec<ServiceError>,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Authentication(AuthFailure),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Whether a failed request may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            AppError::Transport(_) => true,
            AppError::Service { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the host should prompt for new credentials.
    pub fn is_authentication(&self) -> bool {
        matches!(self, AppError::Authentication(_))
    }
}

/// Structured error record returned by the annotation service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    /// Unique id of the record the error refers to, if any
    #[serde(default)]
    pub id: Option<String>,
}

impl ServiceError {
    fn join(errors: &[ServiceError]) -> String {
        if errors.is_empty() {
            return "no details".to_string();
        }
        errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.message) {
            (Some(code), Some(message)) => write!(f, "{}: {}", code, message),
            (Some(code), None) => write!(f, "{}", code),
            (None, Some(message)) => write!(f, "{}", message),
            (None, None) => write!(f, "unknown error"),
        }?;
        if let Some(id) = &self.id {
            write!(f, " ({})", id)?;
        }
        Ok(())
    }
}

/// Reason the service refused our session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    InvalidCredentials,
    AccountLocked,
    PasswordExpired,
    SessionExpired,
}

impl AuthFailure {
    /// Map the service's error codes onto an authentication failure.
    /// Unknown codes are treated as an expired session.
    pub fn from_errors(errors: &[ServiceError]) -> Self {
        for code in errors.iter().filter_map(|e| e.code.as_deref()) {
            match code.to_ascii_lowercase().as_str() {
                "invalid_credentials" | "bad_credentials" | "invalidcredentials" => {
                    return AuthFailure::InvalidCredentials
                }
                "account_locked" | "locked" | "lockout" => return AuthFailure::AccountLocked,
                "password_expired" | "passwordexpired" => return AuthFailure::PasswordExpired,
                _ => {}
            }
        }
        AuthFailure::SessionExpired
    }
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AuthFailure::InvalidCredentials => "invalid credentials",
            AuthFailure::AccountLocked => "account locked",
            AuthFailure::PasswordExpired => "password expired",
            AuthFailure::SessionExpired => "session expired",
        };
        f.write_str(text)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
