//! Service-level error taxonomy.
//!
//! Every seam has its own error type; they all fold into [`ServiceError`],
//! which tells the caller whether to retry later, fix their input, or stop
//! and contact support.

use crate::job::InvalidJobId;
use crate::job_store::StoreError;
use crate::payments::PaymentError;
use crate::storage::StorageError;
use crate::transform::TransformError;
use serde::Serialize;
use thiserror::Error;

/// What the caller should do about a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryClass {
    RetryLater,
    FixInput,
    ContactSupport,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed input, rejected before any state mutation
    #[error("{0}")]
    Validation(String),

    /// Unknown job or missing blob
    #[error("{0}")]
    NotFound(String),

    /// Another caller holds the job
    #[error("{0}")]
    Conflict(String),

    /// Storage, image API, payment processor or database failed
    #[error("{0}")]
    Upstream(String),

    /// Payment or migration request that must never be applied
    #[error("{0}")]
    Integrity(String),

    /// Access to a locked asset before purchase
    #[error("{0}")]
    Forbidden(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "VALIDATION_FAILED",
            ServiceError::NotFound(_) => "NOT_FOUND",
            ServiceError::Conflict(_) => "CONFLICT",
            ServiceError::Upstream(_) => "UPSTREAM_FAILURE",
            ServiceError::Integrity(_) => "INTEGRITY_VIOLATION",
            ServiceError::Forbidden(_) => "FORBIDDEN",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            ServiceError::Conflict(_) | ServiceError::Upstream(_) => RetryClass::RetryLater,
            ServiceError::Validation(_) | ServiceError::NotFound(_) | ServiceError::Forbidden(_) => {
                RetryClass::FixInput
            }
            ServiceError::Integrity(_) => RetryClass::ContactSupport,
        }
    }
}

impl From<InvalidJobId> for ServiceError {
    fn from(e: InvalidJobId) -> Self {
        ServiceError::Validation(e.to_string())
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        ServiceError::Upstream(e.to_string())
    }
}

impl From<StorageError> for ServiceError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound { .. } => ServiceError::NotFound(e.to_string()),
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

impl From<TransformError> for ServiceError {
    fn from(e: TransformError) -> Self {
        match e {
            // Problems with the stored input itself
            TransformError::InputTooLarge { .. }
            | TransformError::UnsupportedType(_)
            | TransformError::Decode(_) => ServiceError::Validation(e.to_string()),
            other => ServiceError::Upstream(other.to_string()),
        }
    }
}

impl From<PaymentError> for ServiceError {
    fn from(e: PaymentError) -> Self {
        ServiceError::Upstream(e.to_string())
    }
}
