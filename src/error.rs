//! Errors surfaced to HTTP callers.

use crate::gradle::BuildError;
use crate::request::MissingFiles;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::io;
use tracing::{error, warn};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    MissingFiles(#[from] MissingFiles),
    #[error("Invalid request body")]
    InvalidBody(String),
    #[error("Too many concurrent builds")]
    Busy { limit: usize },
    #[error("APK compilation failed")]
    Workspace(#[source] io::Error),
    #[error("APK compilation failed")]
    Materialize(#[source] io::Error),
    #[error("APK compilation failed")]
    Build(#[from] BuildError),
    #[error("APK compilation failed")]
    Artifact(#[source] io::Error),
    #[error("APK compilation failed")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFiles(_) | ApiError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ApiError::Busy { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<String> {
        match self {
            ApiError::MissingFiles(_) => None,
            ApiError::InvalidBody(reason) => Some(reason.clone()),
            ApiError::Busy { limit } => Some(format!("at most {limit} builds may run at once")),
            ApiError::Workspace(e) => Some(format!("failed to create workspace: {e}")),
            ApiError::Materialize(e) => Some(format!("failed to write project files: {e}")),
            ApiError::Build(e) => Some(e.to_string()),
            ApiError::Artifact(e) => Some(format!("failed to open artifact: {e}")),
            ApiError::Internal(reason) => Some(reason.clone()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let details = self.details();
        if status.is_server_error() {
            error!(status = status.as_u16(), details = ?details, "Request failed");
        } else {
            warn!(status = status.as_u16(), error = %self, "Request rejected");
        }

        let body = ErrorBody {
            error: self.to_string(),
            details,
        };
        (status, Json(body)).into_response()
    }
}
