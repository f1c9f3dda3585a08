//! HTTP pipeline backend.
//!
//! Talks to a pipeline worker process that owns the parsing, pose and
//! diffusion models. Images travel as base64 inside JSON bodies.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    Keypoint, LoadedModel, ParseOutput, PipelineBackend, PipelineError, PoseOutput, Result,
    SynthesisInput, VariantSpec,
};
use crate::validate::ValidatedImage;

/// Longest backend error body kept in an error message.
const MAX_ERROR_BODY: usize = 512;

/// Pipeline backend reached over HTTP.
pub struct HttpPipeline {
    http_client: Client,
    base_url: String,
}

impl HttpPipeline {
    pub fn new(base_url: &str) -> Self {
        Self {
            http_client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_json<B, R>(&self, path: &str, body: &B) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);

        let response = self
            .http_client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| PipelineError::Communication(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let mut message = response.text().await.unwrap_or_default();
            truncate_on_char_boundary(&mut message, MAX_ERROR_BODY);
            return Err(PipelineError::Remote { status, message });
        }

        response
            .json()
            .await
            .map_err(|e| PipelineError::InvalidResponse(e.to_string()))
    }
}

/// Cut `text` to at most `max` bytes without splitting a character.
fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}

fn decode_image(field: &str, data: &str) -> Result<Bytes> {
    BASE64
        .decode(data.trim())
        .map(Bytes::from)
        .map_err(|e| PipelineError::InvalidResponse(format!("{} is not valid base64: {}", field, e)))
}

// ============================================================================
// Worker API types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoadRequest<'a> {
    variant: &'a str,
    device: &'a str,
    precision: &'a str,
    checkpoint: String,
}

#[derive(Debug, Deserialize)]
struct LoadResponse {
    session: String,
    #[serde(default)]
    memory_bytes: Option<u64>,
}

#[derive(Debug, Serialize)]
struct UnloadRequest<'a> {
    session: &'a str,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    session: &'a str,
    image: String,
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    label_map: String,
}

#[derive(Debug, Deserialize)]
struct PoseResponse {
    keypoints: Vec<Keypoint>,
}

#[derive(Debug, Serialize)]
struct SynthesizeRequest<'a> {
    session: &'a str,
    category: String,
    subject: String,
    garment: String,
    label_map: String,
    keypoints: &'a [Keypoint],
    num_samples: u32,
    num_steps: u32,
    image_scale: f32,
    seed: i64,
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct SynthesizeResponse {
    images: Vec<String>,
}

// ============================================================================
// PipelineBackend implementation
// ============================================================================

#[async_trait]
impl PipelineBackend for HttpPipeline {
    fn backend_type(&self) -> &'static str {
        "http"
    }

    async fn probe(&self, device: &str) -> Result<()> {
        let url = format!("{}/v1/devices/{}", self.base_url, device);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Communication(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(PipelineError::DeviceUnavailable(format!(
                "{} probe returned {}",
                device,
                response.status()
            )))
        }
    }

    async fn load_variant(&self, spec: &VariantSpec) -> Result<LoadedModel> {
        let request = LoadRequest {
            variant: spec.variant.as_str(),
            device: &spec.device,
            precision: spec.precision.as_str(),
            checkpoint: spec.checkpoint.display().to_string(),
        };

        let response: LoadResponse = self.post_json("/v1/variants/load", &request).await?;

        Ok(LoadedModel {
            variant: spec.variant,
            device: spec.device.clone(),
            session: response.session,
            memory_bytes: response.memory_bytes.unwrap_or(0),
        })
    }

    async fn unload_variant(&self, model: &LoadedModel) -> Result<()> {
        let request = UnloadRequest {
            session: &model.session,
        };
        let _: Empty = self.post_json("/v1/variants/unload", &request).await?;
        Ok(())
    }

    async fn parse(&self, model: &LoadedModel, subject: &ValidatedImage) -> Result<ParseOutput> {
        let request = ImageRequest {
            session: &model.session,
            image: BASE64.encode(&subject.bytes),
        };

        let response: ParseResponse = self.post_json("/v1/parse", &request).await?;

        Ok(ParseOutput {
            label_map: decode_image("label_map", &response.label_map)?,
        })
    }

    async fn estimate_pose(
        &self,
        model: &LoadedModel,
        subject: &ValidatedImage,
    ) -> Result<PoseOutput> {
        let request = ImageRequest {
            session: &model.session,
            image: BASE64.encode(&subject.bytes),
        };

        let response: PoseResponse = self.post_json("/v1/pose", &request).await?;

        Ok(PoseOutput {
            keypoints: response.keypoints,
        })
    }

    async fn synthesize(
        &self,
        model: &LoadedModel,
        input: SynthesisInput<'_>,
    ) -> Result<Vec<Bytes>> {
        let request = SynthesizeRequest {
            session: &model.session,
            category: input.category.to_string(),
            subject: BASE64.encode(&input.subject.bytes),
            garment: BASE64.encode(&input.garment.bytes),
            label_map: BASE64.encode(&input.parse.label_map),
            keypoints: &input.pose.keypoints,
            num_samples: input.params.samples,
            num_steps: input.params.steps,
            image_scale: input.params.guidance_scale,
            seed: input.params.seed,
            width: input.width,
            height: input.height,
        };

        let response: SynthesizeResponse = self.post_json("/v1/synthesize", &request).await?;

        if response.images.len() != input.params.samples as usize {
            return Err(PipelineError::InvalidResponse(format!(
                "expected {} images, got {}",
                input.params.samples,
                response.images.len()
            )));
        }

        response
            .images
            .iter()
            .map(|image| decode_image("images", image))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Precision;
    use tryon_common::{Category, Variant};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn loaded() -> LoadedModel {
        LoadedModel {
            variant: Variant::HalfBody,
            device: "cuda:0".to_string(),
            session: "sess-1".to_string(),
            memory_bytes: 0,
        }
    }

    fn image() -> ValidatedImage {
        ValidatedImage {
            bytes: Bytes::from_static(b"subject-bytes"),
            format: image::ImageFormat::Png,
            width: 768,
            height: 1024,
        }
    }

    #[test]
    fn test_backend_type() {
        assert_eq!(HttpPipeline::new("http://localhost:7866/").backend_type(), "http");
    }

    #[tokio::test]
    async fn test_load_variant_returns_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/variants/load"))
            .and(body_partial_json(serde_json::json!({
                "variant": "dc",
                "device": "cuda:1",
                "precision": "float16"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "session": "dc-42",
                "memory_bytes": 9_000_000_000u64
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let model = backend
            .load_variant(&VariantSpec {
                variant: Variant::FullBody,
                device: "cuda:1".to_string(),
                precision: Precision::Float16,
                checkpoint: "checkpoints/ootd/ootd_dc".into(),
            })
            .await
            .unwrap();

        assert_eq!(model.session, "dc-42");
        assert_eq!(model.memory_bytes, 9_000_000_000);
        assert_eq!(model.variant, Variant::FullBody);
    }

    #[tokio::test]
    async fn test_parse_decodes_label_map() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/parse"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "label_map": BASE64.encode(b"mask")
            })))
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let output = backend.parse(&loaded(), &image()).await.unwrap();
        assert_eq!(output.label_map.as_ref(), b"mask");
    }

    #[tokio::test]
    async fn test_remote_error_keeps_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/pose"))
            .respond_with(ResponseTemplate::new(500).set_body_string("out of memory"))
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let err = backend.estimate_pose(&loaded(), &image()).await.unwrap_err();
        match err {
            PipelineError::Remote { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "out of memory");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_long_multibyte_error_body_is_cut_cleanly() {
        let server = MockServer::start().await;
        let body = format!("{}é tail", "a".repeat(MAX_ERROR_BODY - 1));
        Mock::given(method("POST"))
            .and(path("/v1/parse"))
            .respond_with(ResponseTemplate::new(500).set_body_string(body))
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let err = backend.parse(&loaded(), &image()).await.unwrap_err();
        match err {
            PipelineError::Remote { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "a".repeat(MAX_ERROR_BODY - 1));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_truncate_keeps_short_text() {
        let mut text = "déjà vu".to_string();
        truncate_on_char_boundary(&mut text, 64);
        assert_eq!(text, "déjà vu");

        truncate_on_char_boundary(&mut text, 2);
        assert_eq!(text, "d");
    }

    #[tokio::test]
    async fn test_synthesize_rejects_wrong_sample_count() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/synthesize"))
            .and(body_partial_json(serde_json::json!({
                "category": "upperbody",
                "num_samples": 2
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "images": [BASE64.encode(b"one")]
            })))
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let subject = image();
        let garment = image();
        let parse = ParseOutput {
            label_map: Bytes::from_static(b"mask"),
        };
        let pose = PoseOutput::default();
        let params = crate::validate::SamplingParams {
            samples: 2,
            steps: 20,
            guidance_scale: 2.0,
            seed: -1,
        };

        let err = backend
            .synthesize(
                &loaded(),
                SynthesisInput {
                    subject: &subject,
                    garment: &garment,
                    parse: &parse,
                    pose: &pose,
                    category: Category::UpperBody,
                    params: &params,
                    width: 768,
                    height: 1024,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_probe_unreachable_device() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/devices/cuda:0"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let backend = HttpPipeline::new(&server.uri());
        let err = backend.probe("cuda:0").await.unwrap_err();
        assert!(matches!(err, PipelineError::DeviceUnavailable(_)));
    }
}
