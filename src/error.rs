use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use thiserror::Error;

/// Failures reported by the extraction/transfer engine.
///
/// The `Display` text is what the failure classifier inspects, so engine
/// stderr is carried through verbatim.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{stderr}")]
    Failed { code: Option<i32>, stderr: String },

    #[error("could not parse engine output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Extraction chain gave up; the message is already user-facing.
    #[error("{0}")]
    Exhausted(String),
}

/// Failures of a single task-body attempt, grouped by where they happened.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Extraction(String),

    #[error("{0}")]
    Transfer(String),

    #[error("download finished but no output file was found: {0}")]
    MissingOutput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TaskError {
    /// Internal errors skip classification and always fail the task.
    pub fn is_classifiable(&self) -> bool {
        !matches!(self, TaskError::Internal(_))
    }
}

/// Rejections at the task-creation boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreateError {
    #[error("URL cannot be empty")]
    EmptyUrl,

    #[error("unsupported URL scheme in '{0}', expected http or https")]
    UnsupportedScheme(String),

    #[error("format selector cannot be blank")]
    BlankFormat,

    #[error("worker pool is shut down")]
    PoolClosed,
}

/// Errors returned by HTTP handlers.
pub enum AppError {
    Internal(anyhow::Error),
    Engine(String),
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Internal(e) => {
                tracing::error!("Internal server error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "An internal server error occurred".to_string(),
                )
            }
            AppError::Engine(e) => (StatusCode::BAD_GATEWAY, format!("extraction failed: {}", e)),
            AppError::BadRequest(e) => (StatusCode::BAD_REQUEST, e),
            AppError::NotFound(e) => (StatusCode::NOT_FOUND, e),
        };

        let body = Json(json!({ "error": error_message }));
        (status, body).into_response()
    }
}

/// Anything not mapped explicitly surfaces as a 500.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
