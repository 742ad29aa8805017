use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("bad request: {0}")]
    Validation(String),
    #[error("booking not payable: {0}")]
    NotPayable(String),
    #[error("payment gateway temporarily unavailable: {0}")]
    GatewayUnavailable(String),
    #[error("payment gateway rejected credentials: {0}")]
    InvalidCredentials(String),
    #[error("billing configuration error: {0}")]
    Configuration(String),
    #[error("webhook signature rejected")]
    InvalidSignature,
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) | AppError::NotPayable(_) | AppError::InvalidSignature => {
                StatusCode::BAD_REQUEST
            }
            AppError::GatewayUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::InvalidCredentials(_) => StatusCode::BAD_REQUEST,
            AppError::Configuration(_) | AppError::Db(_) | AppError::Message(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if matches!(self, AppError::InvalidSignature) {
            tracing::warn!("rejected webhook with invalid signature");
        } else {
            tracing::error!(?self);
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
