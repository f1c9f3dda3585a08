//! Test helpers shared by unit and integration tests.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use tryon_common::{Category, Variant};
use uuid::Uuid;

use crate::config::Config;
use crate::pipeline::{
    Keypoint, LoadedModel, ParseOutput, PipelineBackend, PipelineError, PoseOutput, Result,
    SynthesisInput, VariantSpec,
};
use crate::validate::{ProcessingRequest, SamplingParams, ValidatedImage};

/// Encode a solid-colour image of the given size.
pub fn encoded_image(format: ImageFormat, width: u32, height: u32) -> Bytes {
    let rgb = RgbImage::from_pixel(width, height, Rgb([180, 120, 90]));
    let image = match format {
        ImageFormat::Gif | ImageFormat::Png | ImageFormat::WebP => {
            DynamicImage::ImageRgba8(DynamicImage::ImageRgb8(rgb).to_rgba8())
        }
        _ => DynamicImage::ImageRgb8(rgb),
    };

    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), format)
        .expect("encode test image");
    Bytes::from(buf)
}

pub fn validated_image(width: u32, height: u32) -> ValidatedImage {
    ValidatedImage {
        bytes: encoded_image(ImageFormat::Jpeg, width, height),
        format: ImageFormat::Jpeg,
        width,
        height,
    }
}

/// A valid single-sample request for the given variant.
pub fn test_request(variant: Variant) -> ProcessingRequest {
    ProcessingRequest {
        id: Uuid::new_v4(),
        subject: validated_image(96, 128),
        garment: validated_image(96, 128),
        variant,
        category: Category::UpperBody,
        params: SamplingParams {
            samples: 1,
            steps: 20,
            guidance_scale: 2.0,
            seed: -1,
        },
        submitted_at: Utc::now(),
    }
}

/// A configuration rooted in `dir` with a complete checkpoint tree and fast
/// timeouts. Passes [`Config::validate`].
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    let checkpoints = dir.join("checkpoints");
    for sub in config
        .models
        .shared_checkpoints
        .iter()
        .chain([&config.variants.hd.checkpoint, &config.variants.dc.checkpoint])
    {
        std::fs::create_dir_all(checkpoints.join(sub)).expect("create checkpoint dir");
    }

    config.server.environment = "testing".to_string();
    config.models.checkpoints_dir = checkpoints.display().to_string();
    config.models.preload = false;
    config.results.dir = dir.join("results").display().to_string();
    config.logging.dir = None;
    config.pipeline.output_width = 64;
    config.pipeline.output_height = 96;
    config
}

/// In-process pipeline backend with scripted behaviour.
///
/// Stage names are `parse`, `pose` and `synthesize`.
pub struct ScriptedBackend {
    load_delay: Duration,
    load_failures: AtomicU32,
    model_memory: u64,
    stage_delays: HashMap<&'static str, Duration>,
    failing_stages: Vec<&'static str>,
    panicking_stages: Vec<&'static str>,
    probe_ok: AtomicBool,
    loads: AtomicUsize,
    unloads: AtomicUsize,
    calls: Mutex<Vec<&'static str>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            load_delay: Duration::ZERO,
            load_failures: AtomicU32::new(0),
            model_memory: 0,
            stage_delays: HashMap::new(),
            failing_stages: Vec::new(),
            panicking_stages: Vec::new(),
            probe_ok: AtomicBool::new(true),
            loads: AtomicUsize::new(0),
            unloads: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Fail the next `count` loads. `u32::MAX` fails every load.
    pub fn failing_loads(self, count: u32) -> Self {
        self.load_failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_model_memory(mut self, bytes: u64) -> Self {
        self.model_memory = bytes;
        self
    }

    pub fn with_stage_delay(mut self, stage: &'static str, delay: Duration) -> Self {
        self.stage_delays.insert(stage, delay);
        self
    }

    pub fn failing_stage(mut self, stage: &'static str) -> Self {
        self.failing_stages.push(stage);
        self
    }

    /// Make `stage` panic instead of answering.
    pub fn panicking_stage(mut self, stage: &'static str) -> Self {
        self.panicking_stages.push(stage);
        self
    }

    pub fn set_probe_ok(&self, ok: bool) {
        self.probe_ok.store(ok, Ordering::SeqCst);
    }

    pub fn load_calls(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Stage calls in the order they were made.
    pub fn stage_calls(&self) -> Vec<&'static str> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_to(&self, stage: &str) -> usize {
        self.stage_calls().iter().filter(|s| **s == stage).count()
    }

    async fn enter(&self, stage: &'static str) -> Result<()> {
        self.calls.lock().expect("calls lock").push(stage);
        if let Some(delay) = self.stage_delays.get(stage) {
            tokio::time::sleep(*delay).await;
        }
        if self.panicking_stages.contains(&stage) {
            panic!("scripted {} panic", stage);
        }
        if self.failing_stages.contains(&stage) {
            return Err(PipelineError::Remote {
                status: 500,
                message: format!("scripted {} failure at /srv/worker/{}.py", stage, stage),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineBackend for ScriptedBackend {
    fn backend_type(&self) -> &'static str {
        "scripted"
    }

    async fn probe(&self, device: &str) -> Result<()> {
        if self.probe_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PipelineError::DeviceUnavailable(device.to_string()))
        }
    }

    async fn load_variant(&self, spec: &VariantSpec) -> Result<LoadedModel> {
        let call = self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }

        let failing = self
            .load_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(PipelineError::Remote {
                status: 500,
                message: format!("missing weights in {}", spec.checkpoint.display()),
            });
        }

        Ok(LoadedModel {
            variant: spec.variant,
            device: spec.device.clone(),
            session: format!("{}-{}", spec.variant, call),
            memory_bytes: self.model_memory,
        })
    }

    async fn unload_variant(&self, _model: &LoadedModel) -> Result<()> {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn parse(&self, _model: &LoadedModel, subject: &ValidatedImage) -> Result<ParseOutput> {
        self.enter("parse").await?;
        Ok(ParseOutput {
            label_map: encoded_image(ImageFormat::Png, subject.width, subject.height),
        })
    }

    async fn estimate_pose(
        &self,
        _model: &LoadedModel,
        _subject: &ValidatedImage,
    ) -> Result<PoseOutput> {
        self.enter("pose").await?;
        Ok(PoseOutput {
            keypoints: vec![Keypoint {
                x: 0.5,
                y: 0.2,
                confidence: 0.9,
            }],
        })
    }

    async fn synthesize(
        &self,
        _model: &LoadedModel,
        input: SynthesisInput<'_>,
    ) -> Result<Vec<Bytes>> {
        self.enter("synthesize").await?;
        Ok((0..input.params.samples)
            .map(|_| encoded_image(ImageFormat::Jpeg, input.width, input.height))
            .collect())
    }
}
