//! # Merx Web
//!
//! Shared Axum plumbing for Merx services:
//!
//! - [`correlation`]: `X-Correlation-ID` middleware and extractor
//! - [`error`]: the uniform wire error body and the single domain→HTTP
//!   translator
//! - [`health`]: the actuator health endpoint

pub mod correlation;
pub mod error;
pub mod health;

pub use correlation::{CORRELATION_ID_HEADER, CorrelationId, correlation_id_layer};
pub use error::{ApiError, ValidationError};
