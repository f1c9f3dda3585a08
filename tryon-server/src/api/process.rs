//! Try-on processing endpoint.
//!
//! Accepts either `multipart/form-data` with two image files, or a JSON body
//! carrying the images as base64 (plain or `data:` URLs). Setting
//! `return_images` also returns the generated PNGs inline as base64.

use std::sync::Arc;

use axum::async_trait;
use axum::extract::multipart::Field;
use axum::extract::{FromRequest, Multipart, Request, State};
use axum::http::header;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;
use tryon_common::ProcessResponse;
use uuid::Uuid;

use crate::error::{
    ImageField, ProcessingError, Result, ServiceError, StageFailure, ValidationError,
};
use crate::orchestrator::JobStage;
use crate::state::AppState;
use crate::store::{ResultId, ResultStore};
use crate::validate::{RawImage, RawProcessRequest};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/process", post(process))
        .route("/tryon", post(process))
}

/// POST /process - Validate, queue and run one try-on job.
///
/// The response is sent once the job finishes. If the caller disconnects
/// first, the job is cancelled at the next stage boundary.
async fn process(
    State(state): State<Arc<AppState>>,
    ProcessForm { raw, return_images }: ProcessForm,
) -> Result<Json<ProcessResponse>> {
    let request = state.validator.validate(raw)?;
    let job_id = request.id;

    tracing::info!(
        job_id = %job_id,
        variant = %request.variant,
        category = %request.category,
        samples = request.params.samples,
        steps = request.params.steps,
        "Accepted try-on request"
    );

    let mut ticket = state.orchestrator.submit(request)?;
    let outcome = ticket.wait().await?;

    let result_images = if return_images {
        Some(inline_images(state.store.clone(), job_id, outcome.result_ids.clone()).await?)
    } else {
        None
    };

    Ok(Json(ProcessResponse {
        success: true,
        message: format!("Generated {} image(s)", outcome.result_ids.len()),
        job_id,
        result_ids: outcome.result_ids.iter().map(|id| id.to_string()).collect(),
        processing_time_seconds: outcome.elapsed.as_secs_f64(),
        result_images,
    }))
}

/// Read back the stored PNGs of a finished job as base64.
async fn inline_images(
    store: Arc<ResultStore>,
    job_id: Uuid,
    ids: Vec<ResultId>,
) -> Result<Vec<String>> {
    let storage_error = move |detail: String| -> ServiceError {
        ProcessingError {
            job_id,
            stage: JobStage::Postprocessing,
            failure: StageFailure::Storage(detail),
        }
        .into()
    };

    tokio::task::spawn_blocking(move || {
        ids.iter()
            .map(|id| {
                store
                    .fetch(id.as_str())
                    .map(|artifact| BASE64.encode(&artifact.png))
                    .map_err(|e| storage_error(format!("result {} unreadable: {}", id, e)))
            })
            .collect::<Result<Vec<_>>>()
    })
    .await
    .map_err(|e| storage_error(format!("result read task failed: {}", e)))?
}

/// A process request read from either supported body format.
pub struct ProcessForm {
    pub raw: RawProcessRequest,
    /// Return the generated PNGs inline.
    pub return_images: bool,
}

#[async_trait]
impl<S> FromRequest<S> for ProcessForm
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| malformed(e.body_text()))?;
            read_multipart(multipart).await
        } else if content_type.starts_with("application/json") {
            let Json(body) = Json::<JsonProcessRequest>::from_request(req, state)
                .await
                .map_err(|e| malformed(e.body_text()))?;
            let return_images = body.return_images;
            Ok(ProcessForm {
                raw: body.into_raw()?,
                return_images,
            })
        } else {
            Err(malformed(
                "expected a multipart/form-data or application/json body".to_string(),
            ))
        }
    }
}

fn malformed(detail: String) -> ServiceError {
    ValidationError::Malformed(detail).into()
}

async fn read_multipart(mut multipart: Multipart) -> std::result::Result<ProcessForm, ServiceError> {
    let mut raw = RawProcessRequest::default();
    let mut return_images = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| malformed(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "subject" | "model_file" => raw.subject = Some(read_image(field).await?),
            "garment" | "cloth_file" => raw.garment = Some(read_image(field).await?),
            "variant" | "model_type" => raw.variant = Some(read_text(field).await?),
            "category" => raw.category = Some(read_text(field).await?),
            "samples" => raw.samples = Some(read_text(field).await?),
            "steps" => raw.steps = Some(read_text(field).await?),
            "scale" => raw.scale = Some(read_text(field).await?),
            "seed" => raw.seed = Some(read_text(field).await?),
            "return_images" | "returnImages" => return_images = is_truthy(&read_text(field).await?),
            other => tracing::debug!(field = other, "Ignoring unknown form field"),
        }
    }

    Ok(ProcessForm { raw, return_images })
}

fn is_truthy(text: &str) -> bool {
    matches!(
        text.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

async fn read_image(field: Field<'_>) -> std::result::Result<RawImage, ServiceError> {
    let filename = field.file_name().map(str::to_string);
    let content_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await.map_err(|e| malformed(e.body_text()))?;

    Ok(RawImage {
        bytes,
        filename,
        content_type,
    })
}

async fn read_text(field: Field<'_>) -> std::result::Result<String, ServiceError> {
    field.text().await.map_err(|e| malformed(e.body_text()))
}

/// JSON variant of the request body.
#[derive(Debug, Deserialize)]
struct JsonProcessRequest {
    #[serde(default, alias = "model_file", alias = "model_image")]
    subject: Option<String>,
    #[serde(default, alias = "cloth_file", alias = "cloth_image")]
    garment: Option<String>,
    #[serde(default, alias = "model_type")]
    variant: Option<Value>,
    #[serde(default)]
    category: Option<Value>,
    #[serde(default)]
    samples: Option<Value>,
    #[serde(default)]
    steps: Option<Value>,
    #[serde(default)]
    scale: Option<Value>,
    #[serde(default)]
    seed: Option<Value>,
    #[serde(default, alias = "returnImages")]
    return_images: bool,
}

impl JsonProcessRequest {
    fn into_raw(self) -> std::result::Result<RawProcessRequest, ServiceError> {
        Ok(RawProcessRequest {
            subject: decode_image(ImageField::Subject, self.subject)?,
            garment: decode_image(ImageField::Garment, self.garment)?,
            variant: self.variant.and_then(value_text),
            category: self.category.and_then(value_text),
            samples: self.samples.and_then(value_text),
            steps: self.steps.and_then(value_text),
            scale: self.scale.and_then(value_text),
            seed: self.seed.and_then(value_text),
        })
    }
}

/// Scalars keep their textual form so the validator reports bad values
/// exactly as it does for form fields.
fn value_text(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Decode a base64 payload, accepting `data:<mime>;base64,` URLs.
fn decode_image(
    field: ImageField,
    data: Option<String>,
) -> std::result::Result<Option<RawImage>, ServiceError> {
    let Some(data) = data else {
        return Ok(None);
    };

    let (content_type, payload) = match data.strip_prefix("data:") {
        Some(rest) => match rest.split_once(',') {
            Some((meta, payload)) => (
                meta.split(';').next().filter(|m| !m.is_empty()).map(str::to_string),
                payload,
            ),
            None => (None, rest),
        },
        None => (None, data.as_str()),
    };

    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(payload.as_bytes())
        .map_err(|e| ValidationError::UndecodableImage {
            field,
            reason: format!("invalid base64: {}", e),
        })?;

    Ok(Some(RawImage {
        bytes: Bytes::from(bytes),
        filename: None,
        content_type,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_data_url() {
        let data = format!("data:image/png;base64,{}", BASE64.encode(b"png-bytes"));
        let image = decode_image(ImageField::Subject, Some(data)).unwrap().unwrap();
        assert_eq!(image.bytes.as_ref(), b"png-bytes");
        assert_eq!(image.content_type.as_deref(), Some("image/png"));
    }

    #[test]
    fn test_decode_plain_base64_with_line_breaks() {
        let encoded = BASE64.encode(b"jpeg-bytes-jpeg-bytes");
        let wrapped = format!("{}\n{}", &encoded[..8], &encoded[8..]);
        let image = decode_image(ImageField::Garment, Some(wrapped)).unwrap().unwrap();
        assert_eq!(image.bytes.as_ref(), b"jpeg-bytes-jpeg-bytes");
    }

    #[test]
    fn test_invalid_base64_is_undecodable() {
        let err = decode_image(ImageField::Garment, Some("***".to_string())).unwrap_err();
        match err {
            ServiceError::Validation(e) => assert_eq!(e.code(), "undecodable_image"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_truthy_form_values() {
        assert!(is_truthy("true"));
        assert!(is_truthy(" 1 "));
        assert!(is_truthy("Yes"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_json_return_images_flag() {
        let body: JsonProcessRequest =
            serde_json::from_value(serde_json::json!({ "returnImages": true })).unwrap();
        assert!(body.return_images);

        let body: JsonProcessRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!body.return_images);
    }

    #[test]
    fn test_json_scalars_keep_text_form() {
        let body: JsonProcessRequest = serde_json::from_value(serde_json::json!({
            "model_type": "dc",
            "category": 2,
            "scale": 2.5,
            "seed": null
        }))
        .unwrap();
        let raw = body.into_raw().unwrap();
        assert_eq!(raw.variant.as_deref(), Some("dc"));
        assert_eq!(raw.category.as_deref(), Some("2"));
        assert_eq!(raw.scale.as_deref(), Some("2.5"));
        assert_eq!(raw.seed, None);
        assert!(raw.subject.is_none());
    }
}
