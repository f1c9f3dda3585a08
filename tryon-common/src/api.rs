//! HTTP wire types shared by the server and its clients.
//!
//! Field names are camelCase on the wire.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Variant, VariantStatus};

/// Overall service status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Everything required is serving.
    Healthy,
    /// Still serving, but models are loading or a dependency is flaky.
    Degraded,
    /// A required variant can no longer be loaded.
    Down,
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub models_loaded: bool,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub accelerator_available: bool,
    #[serde(default)]
    pub seconds_since_last_success: Option<f64>,
    #[serde(default)]
    pub accelerator_memory_bytes: u64,
    #[serde(default)]
    pub variants: Vec<VariantHealth>,
    pub version: String,
    pub environment: String,
    pub timestamp: DateTime<Utc>,
}

/// Per-variant entry in the health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantHealth {
    pub variant: Variant,
    pub device: String,
    #[serde(flatten)]
    pub state: VariantStatus,
    /// Handles currently held by in-flight jobs.
    #[serde(default)]
    pub active_handles: usize,
}

/// Response body of a successful `POST /process`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    pub success: bool,
    pub message: String,
    pub job_id: Uuid,
    pub result_ids: Vec<String>,
    pub processing_time_seconds: f64,
    /// Base64 PNGs in `result_ids` order, present only when the caller asked
    /// for them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_images: Option<Vec<String>>,
}

/// Error envelope returned by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Error kind: validation, model_load, processing, resource.
    #[serde(rename = "type")]
    pub error_type: String,
    /// Machine-readable reason within the kind.
    pub code: String,
    pub message: String,
    /// Offending request field, for validation errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Identifier to correlate with server logs, for processing errors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
}
