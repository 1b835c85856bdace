//! Error types.
//!
//! [`StowryError`] is what the service and its collaborators return.  Every
//! value has an [`ErrorKind`] that survives context wrapping, so callers can
//! test `err.is(ErrorKind::NotFound)` no matter how many layers of
//! "operation + path" context were added on the way up.
//!
//! [`ApiError`] is the HTTP-facing error.  It implements
//! [`axum::response::IntoResponse`] and renders the `{error, message}` JSON
//! body; internal failures are logged and replaced with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::auth::SignatureError;
use crate::cursor::CursorError;

/// Result alias used across the library.
pub type Result<T, E = StowryError> = std::result::Result<T, E>;

/// Coarse classification of a [`StowryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidInput,
    Unauthorized,
    PreconditionFailed,
    Cancelled,
    Internal,
}

/// Library error.
#[derive(Debug, Error)]
pub enum StowryError {
    /// The resource is absent or soft-deleted.
    #[error("not found")]
    NotFound,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Cursor(#[from] CursorError),

    #[error("unauthorized: {0}")]
    Unauthorized(#[from] SignatureError),

    #[error("precondition failed")]
    PreconditionFailed,

    /// The caller's cancellation token fired before the work started.
    #[error("operation cancelled")]
    Cancelled,

    /// Another error with operation/path context prepended.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<StowryError>,
    },

    /// Metadata upsert failed after a successful write, and removing the
    /// written bytes failed too.  Both causes are kept.
    #[error("{context}: metadata upsert failed ({metadata}) and cleanup failed: {cleanup}")]
    Compensation {
        context: String,
        #[source]
        metadata: Box<StowryError>,
        cleanup: Box<StowryError>,
    },

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres: {0}")]
    Postgres(#[from] sqlx::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl StowryError {
    /// Shorthand for an [`StowryError::InvalidInput`].
    pub fn invalid(msg: impl Into<String>) -> Self {
        StowryError::InvalidInput(msg.into())
    }

    /// Wrap `self` with a context string.
    pub fn context(self, context: impl Into<String>) -> Self {
        StowryError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The kind of the innermost error.  For a compensation failure this is
    /// the kind of the metadata error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StowryError::NotFound => ErrorKind::NotFound,
            StowryError::InvalidInput(_) | StowryError::Cursor(_) => ErrorKind::InvalidInput,
            StowryError::Unauthorized(_) => ErrorKind::Unauthorized,
            StowryError::PreconditionFailed => ErrorKind::PreconditionFailed,
            StowryError::Cancelled => ErrorKind::Cancelled,
            StowryError::Context { source, .. } => source.kind(),
            StowryError::Compensation { metadata, .. } => metadata.kind(),
            StowryError::Sqlite(_)
            | StowryError::Postgres(_)
            | StowryError::Io(_)
            | StowryError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `true` if this error, or any error it wraps, has `kind`.
    pub fn is(&self, kind: ErrorKind) -> bool {
        match self {
            StowryError::Context { source, .. } => source.is(kind),
            StowryError::Compensation {
                metadata, cleanup, ..
            } => metadata.is(kind) || cleanup.is(kind),
            other => other.kind() == kind,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.is(ErrorKind::NotFound)
    }
}

/// Attach operation context to any error convertible into [`StowryError`].
pub trait ResultExt<T> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T>;

    fn wrap_err_with<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E: Into<StowryError>> ResultExt<T> for std::result::Result<T, E> {
    fn wrap_err(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn wrap_err_with<F, C>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| e.into().context(f()))
    }
}

// ── HTTP errors ─────────────────────────────────────────────────────

/// JSON error body.
#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    /// Machine-readable code, e.g. `not_found`.
    pub error: String,
    /// Human-readable description.
    pub message: String,
}

/// Errors returned by HTTP handlers and middleware.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Object not found")]
    NotFound,

    #[error("Invalid path")]
    InvalidPath,

    #[error("{0}")]
    InvalidParameter(String),

    #[error("{0}")]
    InvalidInput(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("ETag mismatch")]
    PreconditionFailed,

    #[error("Request body exceeds the maximum upload size")]
    PayloadTooLarge,

    /// 416; `size` is the full object length for `Content-Range`.
    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable { size: i64 },

    #[error("Internal server error")]
    Internal(#[source] StowryError),
}

impl ApiError {
    /// The `error` code written to the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound => "not_found",
            ApiError::InvalidPath => "invalid_path",
            ApiError::InvalidParameter(_) => "invalid_parameter",
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::Unauthorized(_) => "unauthorized",
            ApiError::PreconditionFailed => "precondition_failed",
            ApiError::PayloadTooLarge => "payload_too_large",
            ApiError::RangeNotSatisfiable { .. } => "range_not_satisfiable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::InvalidPath | ApiError::InvalidParameter(_) | ApiError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StowryError> for ApiError {
    fn from(err: StowryError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => ApiError::NotFound,
            ErrorKind::InvalidInput => ApiError::InvalidInput(err.to_string()),
            ErrorKind::Unauthorized => ApiError::Unauthorized(err.to_string()),
            ErrorKind::PreconditionFailed => ApiError::PreconditionFailed,
            ErrorKind::Cancelled | ErrorKind::Internal => ApiError::Internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if let ApiError::Internal(ref source) = self {
            tracing::error!(error = %source, "request failed");
        }

        let body = ErrorResponse {
            error: self.code().to_string(),
            message: self.to_string(),
        };

        let mut resp = (status, axum::Json(body)).into_response();
        if let ApiError::RangeNotSatisfiable { size } = self {
            if let Ok(v) = axum::http::HeaderValue::from_str(&format!("bytes */{size}")) {
                resp.headers_mut().insert(axum::http::header::CONTENT_RANGE, v);
            }
        }
        resp
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_survives_wrapping() {
        let err = StowryError::NotFound
            .context("get")
            .context("get object 'a.txt'");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "get object 'a.txt': get: not found");
    }

    #[test]
    fn test_source_chain_is_preserved() {
        use std::error::Error as _;
        let err = StowryError::invalid("path cannot be empty").context("create object");
        let source = err.source().expect("wrapped error has a source");
        assert_eq!(source.to_string(), "invalid input: path cannot be empty");
    }

    #[test]
    fn test_compensation_reports_both() {
        let err = StowryError::Compensation {
            context: "create object a.txt".into(),
            metadata: Box::new(StowryError::Internal(anyhow::anyhow!("db down"))),
            cleanup: Box::new(StowryError::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.contains("db down"));
        assert!(msg.contains("cleanup failed: not found"));
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(err.is(ErrorKind::NotFound));
    }

    #[test]
    fn test_cursor_and_signature_kinds() {
        let err: StowryError = CursorError::EmptyPath.into();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err: StowryError = SignatureError::SignatureExpired.into();
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
    }

    #[test]
    fn test_api_error_mapping() {
        assert_eq!(
            ApiError::from(StowryError::NotFound.context("x")).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StowryError::invalid("bad")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StowryError::from(SignatureError::SignatureMismatch)).status_code(),
            StatusCode::UNAUTHORIZED
        );
        let internal = ApiError::from(StowryError::Internal(anyhow::anyhow!("SELECT failed")));
        assert_eq!(internal.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.to_string(), "Internal server error");
        assert_eq!(internal.code(), "internal_error");
    }

    #[tokio::test]
    async fn test_internal_error_body_hides_detail() {
        let resp = ApiError::Internal(StowryError::Internal(anyhow::anyhow!(
            "no such table: stowry_metadata"
        )))
        .into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(!text.contains("stowry_metadata"));
        assert!(text.contains("internal_error"));
    }

    #[test]
    fn test_range_not_satisfiable_sets_content_range() {
        let resp = ApiError::RangeNotSatisfiable { size: 42 }.into_response();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers()["content-range"], "bytes */42");
    }
}
