//! Custom error types for citemap.
//!
//! All fallible operations return `Result<T, CitemapError>` instead of using
//! `unwrap()`. Lookup-side errors are absorbed at the enrichment-client
//! boundary; checkpoint I/O errors propagate and abort the run.

use thiserror::Error;

/// Main error type for citemap operations.
///
/// Uses `thiserror` for ergonomic error handling and automatic `Display` implementation.
#[derive(Debug, Error)]
pub enum CitemapError {
    /// Network/HTTP request error
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTML parsing error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Rate limited by Google Scholar
    #[error("Rate limited, retry after {0}s")]
    RateLimited(u64),

    /// CAPTCHA detected
    #[error("CAPTCHA detected, Scholar is blocking automated requests")]
    Captcha,

    /// External service returned an error
    #[error("API error: {code} - {message}")]
    Api {
        /// HTTP status code
        code: i32,
        /// Error message from the service
        message: String,
    },

    /// File I/O error (checkpoint and report writes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),
}

/// Result type alias using `CitemapError`
pub type Result<T> = std::result::Result<T, CitemapError>;
