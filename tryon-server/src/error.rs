//! Error taxonomy for the try-on server.
//!
//! Every failure surfaced to a caller is one of four kinds: validation,
//! model load, processing or resource. Each kind carries structured fields so
//! callers can branch on it; the HTTP body never carries internal detail, the
//! server log does.

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use tryon_common::{Category, ErrorBody, ErrorResponse, Variant};
use uuid::Uuid;

use crate::orchestrator::JobStage;

/// Which uploaded image a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageField {
    Subject,
    Garment,
}

impl std::fmt::Display for ImageField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageField::Subject => write!(f, "subject"),
            ImageField::Garment => write!(f, "garment"),
        }
    }
}

/// Client-caused request problems. Always recoverable by fixing the request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Missing required image: {field}")]
    MissingImage { field: ImageField },

    #[error("The {field} image could not be decoded: {reason}")]
    UndecodableImage { field: ImageField, reason: String },

    #[error("The {field} image is empty")]
    EmptyImage { field: ImageField },

    #[error("The {field} image is too large: {size} bytes (max: {max})")]
    FileTooLarge {
        field: ImageField,
        size: usize,
        max: usize,
    },

    #[error("The {field} image is {width}x{height}, allowed sides are {min}..={max} pixels")]
    DimensionsOutOfBounds {
        field: ImageField,
        width: u32,
        height: u32,
        min: u32,
        max: u32,
    },

    #[error("The {field} image has unsupported format {detected} (allowed: jpeg, png, bmp)")]
    UnsupportedFormat { field: ImageField, detected: String },

    #[error("Parameter {parameter} is out of range: {value} (allowed: {min}..={max})")]
    OutOfRange {
        parameter: &'static str,
        value: String,
        min: String,
        max: String,
    },

    #[error("Parameter {parameter} has an invalid value: {value}")]
    InvalidParameter {
        parameter: &'static str,
        value: String,
    },

    #[error("Unknown variant: {0} (valid: hd, dc)")]
    UnknownVariant(String),

    #[error("Unknown category: {0} (valid: 0=upperbody, 1=lowerbody, 2=dress)")]
    UnknownCategory(String),

    #[error("Variant {variant} does not accept category {category}")]
    CategoryVariantMismatch { variant: Variant, category: Category },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::Malformed(_) => "malformed_request",
            ValidationError::MissingImage { .. } => "missing_image",
            ValidationError::UndecodableImage { .. } => "undecodable_image",
            ValidationError::EmptyImage { .. } => "empty_image",
            ValidationError::FileTooLarge { .. } => "file_too_large",
            ValidationError::DimensionsOutOfBounds { .. } => "dimensions_out_of_bounds",
            ValidationError::UnsupportedFormat { .. } => "unsupported_format",
            ValidationError::OutOfRange { .. } => "parameter_out_of_range",
            ValidationError::InvalidParameter { .. } => "invalid_parameter",
            ValidationError::UnknownVariant(_) => "unknown_variant",
            ValidationError::UnknownCategory(_) => "unknown_category",
            ValidationError::CategoryVariantMismatch { .. } => "category_variant_mismatch",
        }
    }

    /// The request field at fault, when there is one.
    pub fn field(&self) -> Option<String> {
        match self {
            ValidationError::Malformed(_) => None,
            ValidationError::MissingImage { field }
            | ValidationError::UndecodableImage { field, .. }
            | ValidationError::EmptyImage { field }
            | ValidationError::FileTooLarge { field, .. }
            | ValidationError::DimensionsOutOfBounds { field, .. }
            | ValidationError::UnsupportedFormat { field, .. } => Some(field.to_string()),
            ValidationError::OutOfRange { parameter, .. }
            | ValidationError::InvalidParameter { parameter, .. } => Some(parameter.to_string()),
            ValidationError::UnknownVariant(_) => Some("variant".to_string()),
            ValidationError::UnknownCategory(_) | ValidationError::CategoryVariantMismatch { .. } => {
                Some("category".to_string())
            }
        }
    }
}

/// A variant could not be loaded.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to load variant {variant} (attempt {attempts}): {detail}")]
pub struct ModelLoadError {
    pub variant: Variant,
    pub attempts: u32,
    /// False once the retry budget is exhausted.
    pub retryable: bool,
    /// Backend detail. Logged, never returned to callers.
    pub detail: String,
}

/// Why a job was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller went away before the job finished.
    Disconnected,
    /// The per-job deadline elapsed.
    JobTimeout,
    /// The server is shutting down.
    Shutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Disconnected => write!(f, "caller disconnected"),
            CancelReason::JobTimeout => write!(f, "job timeout elapsed"),
            CancelReason::Shutdown => write!(f, "server shutting down"),
        }
    }
}

/// What went wrong inside a pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageFailure {
    Timeout(Duration),
    Backend(String),
    Storage(String),
    Cancelled(CancelReason),
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageFailure::Timeout(after) => write!(f, "timed out after {:?}", after),
            StageFailure::Backend(detail) => write!(f, "backend error: {}", detail),
            StageFailure::Storage(detail) => write!(f, "storage error: {}", detail),
            StageFailure::Cancelled(reason) => write!(f, "cancelled: {}", reason),
        }
    }
}

/// A job was aborted after admission.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Job {job_id} failed during {stage}: {failure}")]
pub struct ProcessingError {
    /// Doubles as the correlation id returned to the caller.
    pub job_id: Uuid,
    pub stage: JobStage,
    pub failure: StageFailure,
}

impl ProcessingError {
    pub fn code(&self) -> &'static str {
        match self.failure {
            StageFailure::Timeout(_) => "stage_timeout",
            StageFailure::Backend(_) => "stage_failed",
            StageFailure::Storage(_) => "storage_failed",
            StageFailure::Cancelled(CancelReason::JobTimeout) => "job_timeout",
            StageFailure::Cancelled(_) => "cancelled",
        }
    }
}

/// Capacity problems. Callers should retry later.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("Job queue for {device} is full ({capacity} jobs admitted)")]
    QueueFull { device: String, capacity: usize },

    #[error("Accelerator {device} is unavailable")]
    AcceleratorUnavailable { device: String },
}

/// Every error the service surfaces.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Seconds a client should wait before retrying after a resource error.
const RETRY_AFTER_SECS: u64 = 5;

impl ServiceError {
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::ModelLoad(_) => "model_load",
            ServiceError::Processing(_) => "processing",
            ServiceError::Resource(_) => "resource",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::ModelLoad(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServiceError::Processing(e) => match e.failure {
                StageFailure::Timeout(_) | StageFailure::Cancelled(CancelReason::JobTimeout) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ServiceError::Resource(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Body sent to the caller. Backend detail stays in the logs.
    pub fn body(&self) -> ErrorBody {
        let (code, message, field, correlation_id) = match self {
            ServiceError::Validation(e) => (e.code(), e.to_string(), e.field(), None),
            ServiceError::ModelLoad(e) => (
                if e.retryable { "model_loading_failed" } else { "model_unavailable" },
                format!("Variant {} is not available, try again later", e.variant),
                None,
                None,
            ),
            ServiceError::Processing(e) => (
                e.code(),
                format!("Processing failed during {}", e.stage),
                None,
                Some(e.job_id),
            ),
            ServiceError::Resource(e) => (
                match e {
                    ResourceError::QueueFull { .. } => "queue_full",
                    ResourceError::AcceleratorUnavailable { .. } => "accelerator_unavailable",
                },
                "Server is busy, retry later".to_string(),
                None,
                None,
            ),
        };

        ErrorBody {
            error_type: self.kind().to_string(),
            code: code.to_string(),
            message,
            field,
            correlation_id,
        }
    }

    fn log(&self) {
        match self {
            ServiceError::Validation(e) => {
                tracing::info!(code = e.code(), "Rejected request: {}", e);
            }
            ServiceError::Resource(e) => {
                tracing::warn!("Backpressure: {}", e);
            }
            ServiceError::ModelLoad(e) => {
                tracing::error!(
                    variant = %e.variant,
                    attempts = e.attempts,
                    retryable = e.retryable,
                    "{}",
                    e
                );
            }
            ServiceError::Processing(e) => {
                tracing::error!(
                    job_id = %e.job_id,
                    stage = %e.stage,
                    "{}",
                    e
                );
            }
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        self.log();
        let status = self.status();
        let body = Json(ErrorResponse { error: self.body() });

        let mut response = (status, body).into_response();
        if matches!(self, ServiceError::Resource(_) | ServiceError::ModelLoad(_)) {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_error_body_is_redacted() {
        let job_id = Uuid::new_v4();
        let err = ServiceError::from(ProcessingError {
            job_id,
            stage: JobStage::Synthesizing,
            failure: StageFailure::Backend("CUDA OOM at /opt/models/unet.py:42".to_string()),
        });

        let body = err.body();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error_type, "processing");
        assert_eq!(body.code, "stage_failed");
        assert_eq!(body.correlation_id, Some(job_id));
        assert!(!body.message.contains("/opt/models"));
        assert!(!body.message.contains("OOM"));
    }

    #[test]
    fn test_stage_timeout_maps_to_gateway_timeout() {
        let err = ServiceError::from(ProcessingError {
            job_id: Uuid::new_v4(),
            stage: JobStage::Synthesizing,
            failure: StageFailure::Timeout(Duration::from_secs(240)),
        });
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.body().code, "stage_timeout");
    }

    #[test]
    fn test_validation_error_reports_field() {
        let err = ServiceError::from(ValidationError::CategoryVariantMismatch {
            variant: Variant::HalfBody,
            category: Category::LowerBody,
        });
        let body = err.body();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body.code, "category_variant_mismatch");
        assert_eq!(body.field.as_deref(), Some("category"));
    }

    #[test]
    fn test_resource_error_sets_retry_after() {
        let response = ServiceError::from(ResourceError::QueueFull {
            device: "cuda:0".to_string(),
            capacity: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[test]
    fn test_model_load_detail_is_hidden() {
        let err = ServiceError::from(ModelLoadError {
            variant: Variant::FullBody,
            attempts: 3,
            retryable: false,
            detail: "missing /checkpoints/ootd_dc/unet".to_string(),
        });
        let body = err.body();
        assert_eq!(body.code, "model_unavailable");
        assert!(!body.message.contains("checkpoints"));
    }
}
