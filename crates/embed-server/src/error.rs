use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use embed_common::api::ErrorBody;
use embed_common::auth::AuthError;
use embed_common::error::CommonError;

/// Startup errors.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Common(#[from] CommonError),

    #[error("config error: {0}")]
    Config(String),
}

/// Errors surfaced to HTTP callers as `{detail}` bodies.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("encoding failed: {0}")]
    Encoding(String),
}

impl From<CommonError> for ServiceError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Encoding(message) => Self::Encoding(message),
            CommonError::ModelInit(message) | CommonError::Config(message) => {
                Self::ModelUnavailable(message)
            }
        }
    }
}

impl ServiceError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::ModelUnavailable(_) | Self::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            detail: self.to_string(),
        });
        let mut response = (status, body).into_response();
        if status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}
