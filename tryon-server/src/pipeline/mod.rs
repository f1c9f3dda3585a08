//! Pipeline backend abstraction layer.
//!
//! The generation pipeline (human parsing, pose estimation, latent-diffusion
//! synthesis) runs in an external worker. This module defines the narrow
//! `PipelineBackend` trait the orchestrator and model manager talk to, so the
//! serving layer never depends on how the models compute.

mod http;

pub use http::HttpPipeline;

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tryon_common::{Category, Variant};

use crate::config::Precision;
use crate::validate::{SamplingParams, ValidatedImage};

/// Everything needed to load one variant.
#[derive(Debug, Clone)]
pub struct VariantSpec {
    pub variant: Variant,
    pub device: String,
    pub precision: Precision,
    pub checkpoint: PathBuf,
}

/// A variant resident on its device.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub variant: Variant,
    pub device: String,
    /// Backend handle identifying the loaded weights.
    pub session: String,
    /// Accelerator memory held by the weights, if the backend reports it.
    pub memory_bytes: u64,
}

/// Human-parsing label map for the subject image.
#[derive(Debug, Clone)]
pub struct ParseOutput {
    /// Encoded label-map image.
    pub label_map: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub confidence: f32,
}

/// Body keypoints for the subject image.
#[derive(Debug, Clone, Default)]
pub struct PoseOutput {
    pub keypoints: Vec<Keypoint>,
}

/// Inputs to the diffusion stage.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisInput<'a> {
    pub subject: &'a ValidatedImage,
    pub garment: &'a ValidatedImage,
    pub parse: &'a ParseOutput,
    pub pose: &'a PoseOutput,
    pub category: Category,
    pub params: &'a SamplingParams,
    pub width: u32,
    pub height: u32,
}

/// Errors reported by a pipeline backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PipelineError {
    #[error("Backend communication error: {0}")]
    Communication(String),

    #[error("Backend returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Backend returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Device not available: {0}")]
    DeviceUnavailable(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Primary trait for pipeline backends.
///
/// Stage methods are called strictly in order for a job and never
/// concurrently on the same device; the orchestrator wraps each call in a
/// timeout, so implementations do not need their own.
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Unique identifier for this backend type (e.g., "http").
    fn backend_type(&self) -> &'static str;

    /// Cheap reachability check for a device. Must not run inference.
    async fn probe(&self, device: &str) -> Result<()>;

    /// Load a variant's weights onto its device.
    async fn load_variant(&self, spec: &VariantSpec) -> Result<LoadedModel>;

    /// Release a variant's weights. Only called at shutdown.
    async fn unload_variant(&self, model: &LoadedModel) -> Result<()>;

    /// Human parsing of the subject image.
    async fn parse(&self, model: &LoadedModel, subject: &ValidatedImage) -> Result<ParseOutput>;

    /// Pose estimation of the subject image.
    async fn estimate_pose(
        &self,
        model: &LoadedModel,
        subject: &ValidatedImage,
    ) -> Result<PoseOutput>;

    /// Latent-diffusion synthesis. Returns one encoded image per sample.
    async fn synthesize(
        &self,
        model: &LoadedModel,
        input: SynthesisInput<'_>,
    ) -> Result<Vec<Bytes>>;
}
