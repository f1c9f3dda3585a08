//! Model lifecycle management.
//!
//! Each variant is loaded at most once per process and shared by every job
//! that needs it through a [`ModelHandle`].

mod manager;

pub use manager::ModelManager;

use std::ops::Deref;
use std::sync::Arc;

use tryon_common::{Variant, VariantStatus};

use crate::pipeline::LoadedModel;

/// Shared read access to a loaded variant.
///
/// Cloning is cheap. The number of live handles is reported in health
/// snapshots but never drives unloading.
#[derive(Debug, Clone)]
pub struct ModelHandle(Arc<LoadedModel>);

impl ModelHandle {
    pub fn variant(&self) -> Variant {
        self.0.variant
    }

    pub fn device(&self) -> &str {
        &self.0.device
    }
}

impl Deref for ModelHandle {
    type Target = LoadedModel;

    fn deref(&self) -> &LoadedModel {
        &self.0
    }
}

/// Point-in-time view of one variant, for health reporting.
#[derive(Debug, Clone)]
pub struct VariantSnapshot {
    pub variant: Variant,
    pub device: String,
    pub required: bool,
    pub status: VariantStatus,
    /// Handles held outside the manager.
    pub active_handles: usize,
    pub memory_bytes: u64,
}
