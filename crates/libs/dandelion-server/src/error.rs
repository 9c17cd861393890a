//! Server error handling.
//!
//! Every JSON response shares the `{code, info}` envelope: `code = 0` on
//! success, otherwise the HTTP status with a human-readable message in
//! `info`. Domain errors from dandelion-core map onto 400/403/404; anything
//! downstream (db, git, io) surfaces as 500 after being logged.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// The message used for malformed request parameters.
pub const PARAMS_ERROR: &str = "Params error";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Core(#[from] dandelion_core::Error),

    /// Malformed query or form input.
    #[error("Params error")]
    Params,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        use dandelion_core::Error as Core;
        match self {
            ServerError::Core(e) => match e {
                Core::NotFound
                | Core::CommitNotFound(_)
                | Core::BranchNotFound(_)
                | Core::FileNotFound(_)
                | Core::ReleaseNotFound(_)
                | Core::NoMatchingRelease => StatusCode::NOT_FOUND,
                Core::BadPattern(_) | Core::InvalidInput(_) => StatusCode::BAD_REQUEST,
                Core::AppMismatch { .. } => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServerError::Params | ServerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServerError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        use dandelion_core::Error as Core;
        match self {
            // glob compile failures on publish read as malformed params
            ServerError::Core(Core::BadPattern(_)) => PARAMS_ERROR.to_string(),
            ServerError::Core(Core::AppMismatch { .. }) => {
                "config id does not belong to specified app id".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request error");
        }
        let body = json!({
            "code": status.as_u16(),
            "info": self.message(),
        });
        (status, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Wrap a payload in the success envelope.
pub fn succeed<T: Serialize>(info: T) -> Json<serde_json::Value> {
    Json(json!({ "code": 0, "info": info }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use dandelion_core::Error as Core;

    fn envelope(err: ServerError) -> (StatusCode, serde_json::Value) {
        let status = err.status();
        (status, json!({ "code": status.as_u16(), "info": err.message() }))
    }

    #[test]
    fn test_not_found_family_maps_to_404() {
        for err in [
            ServerError::Core(Core::NoMatchingRelease),
            ServerError::Core(Core::CommitNotFound("abc".into())),
            ServerError::Core(Core::FileNotFound("f".into())),
            ServerError::Core(Core::ReleaseNotFound(7)),
        ] {
            let (status, body) = envelope(err);
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(body["code"], 404);
        }
    }

    #[test]
    fn test_bad_glob_reads_as_params_error() {
        let pattern_err = glob::Pattern::new("[oops").unwrap_err();
        let (status, body) = envelope(ServerError::Core(Core::BadPattern(pattern_err)));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["info"], PARAMS_ERROR);
    }

    #[test]
    fn test_app_mismatch_is_forbidden() {
        let err = ServerError::Core(Core::AppMismatch {
            app_id: "app1".into(),
            id: 3,
        });
        let (status, body) = envelope(err);
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["info"], "config id does not belong to specified app id");
    }
}
