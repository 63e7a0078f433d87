//! Error types for the API server.

use armada_cluster::ClusterError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Result type alias for API operations.
pub type Result<T> = std::result::Result<T, ApiError>;

/// Errors that can occur serving the cluster API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Error from the cluster core.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Server-side error (listener, handshake, response building).
    #[error("server error: {0}")]
    Server(String),

    /// Proxy transport error.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl ApiError {
    /// Creates a new server error.
    #[must_use]
    pub fn server(msg: impl Into<String>) -> Self {
        Self::Server(msg.into())
    }

    /// HTTP status for this error, Docker-style: lookups that resolve
    /// nothing are 404, conflicting registrations are 409, remote engine
    /// errors keep the engine's status, everything else is 500.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Cluster(e) => match e {
                ClusterError::NotFound { .. } => StatusCode::NOT_FOUND,
                ClusterError::DuplicateEngine(_) | ClusterError::HandlerExists(_) => {
                    StatusCode::CONFLICT
                }
                ClusterError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                ClusterError::Remote { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Server(_) | Self::Transport(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Docker clients surface the `message` field verbatim.
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let err = ApiError::from(ClusterError::not_found("container", "web"));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn duplicate_engine_maps_to_409() {
        let err = ApiError::from(ClusterError::DuplicateEngine("ENG:1".to_string()));
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn remote_status_is_preserved() {
        let err = ApiError::from(ClusterError::Remote {
            status: 409,
            message: "name already in use".to_string(),
        });
        assert_eq!(err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn transport_maps_to_500() {
        let err = ApiError::from(ClusterError::transport("connection refused"));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
