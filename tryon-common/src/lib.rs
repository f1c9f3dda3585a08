//! Try-on common types
//!
//! Shared types used by the serving layer and its HTTP clients.

pub mod api;
pub mod variant;

pub use api::{
    ErrorBody, ErrorResponse, HealthResponse, HealthStatus, ProcessResponse, VariantHealth,
};
pub use variant::{Category, Variant, VariantStatus};
