//! External service clients
//! Brokerage API for orders and quotes, document store for deal/order/strategy records

pub mod brokerage;
pub mod store;
pub mod paper;

pub use brokerage::{
    Brokerage, BrokerOrder, BrokerOrderStatus, Clock, HttpBrokerage, OrderRequest, OrderSide,
    OrderType, Quote, ReplaceRequest, TimeInForce,
};
pub use store::{
    DealRecord, DealStatus, DealStore, DealUpdate, HttpDocumentStore, OrderLinkage, OrderRecord,
    StrategyRecord, StrategyUpdate,
};
pub use paper::{MemoryStore, PaperBrokerage};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Rate limited")]
    RateLimited,
    #[error("Not found: {0}")]
    NotFound(String),
}

impl ApiError {
    /// Transport failures, rate limits and server-side errors are worth retrying.
    /// Client-side rejections (4xx) are business responses and are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::HttpError(_) => true,
            ApiError::RateLimited => true,
            ApiError::ApiError { status, .. } => *status == 408 || *status >= 500,
            ApiError::JsonError(_) | ApiError::NotFound(_) => false,
        }
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::ApiError { status, .. } => Some(*status),
            ApiError::RateLimited => Some(429),
            ApiError::NotFound(_) => Some(404),
            ApiError::HttpError(e) => e.status().map(|s| s.as_u16()),
            ApiError::JsonError(_) => None,
        }
    }
}

impl crate::utils::retry::Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        ApiError::is_retryable(self)
    }
}

/// Build an `ApiError` from a non-success response.
/// Long bodies are truncated so rejected payload logs stay readable.
pub fn sanitize_api_error(status: u16, detailed_message: String) -> ApiError {
    if status == 429 {
        return ApiError::RateLimited;
    }
    if status == 404 {
        return ApiError::NotFound(truncate(detailed_message));
    }

    ApiError::ApiError {
        status,
        message: truncate(detailed_message),
    }
}

fn truncate(message: String) -> String {
    if message.len() > 500 {
        let mut end = 500;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &message[..end])
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(sanitize_api_error(500, "boom".into()).is_retryable());
        assert!(sanitize_api_error(503, "down".into()).is_retryable());
        assert!(sanitize_api_error(429, "slow down".into()).is_retryable());
        assert!(sanitize_api_error(408, "timeout".into()).is_retryable());
    }

    #[test]
    fn test_rejections_are_not_retryable() {
        let err = sanitize_api_error(403, "insufficient buying power".into());
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(403));

        let err = sanitize_api_error(422, "invalid stop price".into());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_long_messages_truncated() {
        let err = sanitize_api_error(422, "x".repeat(2000));
        match err {
            ApiError::ApiError { message, .. } => {
                assert!(message.len() < 600);
                assert!(message.ends_with("(truncated)"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
