//! API error types with JSON responses.

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::context::PredictError;
use crate::preprocess::PreprocessError;

/// Error response body: `{"error": ...}` plus an optional `detail`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// API-level errors with HTTP status mapping.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No image part")]
    NoImagePart,
    #[error("Cannot process image: {0}")]
    CannotProcessImage(String),
    #[error("Image too large: {0}")]
    PayloadTooLarge(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    /// Body limit overruns become 413; any other multipart failure means
    /// there is no usable image part.
    pub fn from_multipart(err: MultipartError) -> Self {
        if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge(err.body_text())
        } else {
            tracing::warn!(error = %err.body_text(), "Malformed multipart body");
            ApiError::NoImagePart
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NoImagePart | ApiError::CannotProcessImage(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self {
            ApiError::NoImagePart => ErrorBody {
                error: "No image part",
                detail: None,
            },
            ApiError::CannotProcessImage(detail) => ErrorBody {
                error: "Cannot process image",
                detail: Some(detail),
            },
            ApiError::PayloadTooLarge(detail) => ErrorBody {
                error: "Image too large",
                detail: Some(detail),
            },
            ApiError::Internal(detail) => {
                tracing::error!(detail, "Prediction failed");
                ErrorBody {
                    error: "Prediction failed",
                    detail: None,
                }
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<MultipartRejection> for ApiError {
    fn from(rejection: MultipartRejection) -> Self {
        tracing::warn!(error = %rejection.body_text(), "Request is not multipart");
        ApiError::NoImagePart
    }
}

impl From<PredictError> for ApiError {
    fn from(err: PredictError) -> Self {
        match err {
            PredictError::Preprocess(PreprocessError::Decode(detail)) => {
                ApiError::CannotProcessImage(detail)
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}
