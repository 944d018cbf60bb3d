//! Deal error types
//! Rejections and missing data surface here; transient failures never do

use thiserror::Error;

use crate::api::{ApiError, OrderRequest};

/// Errors that end a deal worker without a terminal deal status
#[derive(Error, Debug)]
pub enum DealError {
    /// Brokerage refused an order request as a business error
    #[error("Order rejected: {reason} (request: {request:?})")]
    OrderRejected {
        request: Box<OrderRequest>,
        reason: String,
    },

    /// Brokerage refused a non-submit operation (cancel, replace, lookup)
    #[error("Brokerage refused {operation}: {source}")]
    Brokerage {
        operation: String,
        #[source]
        source: ApiError,
    },

    /// Store refused a read or write
    #[error("Store error during {operation}: {source}")]
    Store {
        operation: String,
        #[source]
        source: ApiError,
    },

    /// A filled order came back without fill data
    #[error("Order {order_id} filled without fill data")]
    MissingFillData { order_id: String },

    /// An order being waited on ended without filling
    #[error("Order {order_id} ended as {status} without filling")]
    OrderNotFilled { order_id: String, status: String },

    /// Deal or strategy record not present in the store
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    /// Worker interrupted before reaching a terminal status
    #[error("Worker shut down")]
    Shutdown,
}

impl DealError {
    pub fn brokerage(operation: &str, source: ApiError) -> Self {
        DealError::Brokerage {
            operation: operation.to_string(),
            source,
        }
    }

    pub fn store(operation: &str, source: ApiError) -> Self {
        DealError::Store {
            operation: operation.to_string(),
            source,
        }
    }

    pub fn rejected(request: &OrderRequest, source: ApiError) -> Self {
        DealError::OrderRejected {
            request: Box::new(request.clone()),
            reason: source.to_string(),
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            DealError::OrderRejected { .. } => "ORDER_REJECTED",
            DealError::Brokerage { .. } => "BROKERAGE",
            DealError::Store { .. } => "STORE",
            DealError::MissingFillData { .. } => "FILL_DATA",
            DealError::OrderNotFilled { .. } => "NOT_FILLED",
            DealError::RecordNotFound(_) => "NOT_FOUND",
            DealError::Shutdown => "SHUTDOWN",
        }
    }
}

pub type DealResult<T> = Result<T, DealError>;
