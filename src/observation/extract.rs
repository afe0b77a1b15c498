//! Extractor capability interface.
//!
//! Vendor-specific fetchers (rate limiting, pagination, auth) live outside
//! the core; they plug in behind this trait. The core never depends on a
//! concrete vendor.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClassification};

use super::VendorObservation;

/// Extractor error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExtractorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Data not available: {0}")]
    DataNotAvailable(String),
}

impl ErrorClassification for ExtractorError {
    fn category(&self) -> ErrorCategory {
        match self {
            ExtractorError::Connection(_) => ErrorCategory::Transient,
            ExtractorError::RateLimit(_) => ErrorCategory::ResourceExhausted,
            ExtractorError::Parse(_) => ErrorCategory::Permanent,
            ExtractorError::DataNotAvailable(_) => ErrorCategory::Permanent,
        }
    }
}

pub type ExtractorResult<T> = Result<T, ExtractorError>;

/// A pluggable vendor extractor.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Source name the extractor writes under; must match its symbology
    /// mappings and vendor weight configuration
    fn source(&self) -> &str;

    /// Fetch raw observations updated since `since` (inclusive)
    async fn fetch(&self, since: NaiveDate) -> ExtractorResult<Vec<VendorObservation>>;
}
