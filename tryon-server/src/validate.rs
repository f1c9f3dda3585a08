//! Request validation.
//!
//! Turns a raw, untrusted request into an immutable [`ProcessingRequest`].
//! Checks run in a fixed order and the first failure wins:
//!
//! 1. both images present and decodable
//! 2. file size and pixel dimensions within bounds
//! 3. format sniffed from the bytes is allowed (client filenames are ignored)
//! 4. parameter ranges
//! 5. category/variant pairing
//!
//! Nothing here touches the accelerator; validation runs inline in the
//! request handler before a job is created.

use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::{ImageFormat, ImageReader};
use serde::Serialize;
use tryon_common::{Category, Variant};
use uuid::Uuid;

use crate::config::LimitsConfig;
use crate::error::{ImageField, ValidationError};

pub const DEFAULT_SAMPLES: u32 = 1;
pub const DEFAULT_STEPS: u32 = 20;
pub const DEFAULT_SCALE: f32 = 2.0;
/// -1 lets the backend pick a random seed.
pub const DEFAULT_SEED: i64 = -1;
pub const MAX_SEED: i64 = i32::MAX as i64;

/// Formats accepted after sniffing.
const ALLOWED_FORMATS: [ImageFormat; 3] = [ImageFormat::Jpeg, ImageFormat::Png, ImageFormat::Bmp];

/// An uploaded image as received.
#[derive(Debug, Clone)]
pub struct RawImage {
    pub bytes: Bytes,
    /// Client-supplied, informational only.
    pub filename: Option<String>,
    /// Client-supplied, informational only.
    pub content_type: Option<String>,
}

impl RawImage {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            filename: None,
            content_type: None,
        }
    }
}

/// A request as received, before any checks. Scalar parameters stay as text
/// so parsing problems are reported in validation order.
#[derive(Debug, Clone, Default)]
pub struct RawProcessRequest {
    pub subject: Option<RawImage>,
    pub garment: Option<RawImage>,
    pub variant: Option<String>,
    pub category: Option<String>,
    pub samples: Option<String>,
    pub steps: Option<String>,
    pub scale: Option<String>,
    pub seed: Option<String>,
}

/// An image that passed every check.
#[derive(Debug, Clone)]
pub struct ValidatedImage {
    pub bytes: Bytes,
    /// Format sniffed from the content.
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

/// Diffusion sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SamplingParams {
    pub samples: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub seed: i64,
}

/// A validated unit of work. Immutable once built.
#[derive(Debug, Clone)]
pub struct ProcessingRequest {
    pub id: Uuid,
    pub subject: ValidatedImage,
    pub garment: ValidatedImage,
    pub variant: Variant,
    pub category: Category,
    pub params: SamplingParams,
    pub submitted_at: DateTime<Utc>,
}

/// Bounds applied by the validator.
#[derive(Debug, Clone)]
pub struct ValidationLimits {
    pub max_file_bytes: usize,
    pub min_dimension: u32,
    pub max_dimension: u32,
    pub max_samples: u32,
    pub max_steps: u32,
    pub min_scale: f32,
    pub max_scale: f32,
}

impl From<&LimitsConfig> for ValidationLimits {
    fn from(limits: &LimitsConfig) -> Self {
        Self {
            max_file_bytes: limits.max_file_bytes,
            min_dimension: limits.min_dimension,
            max_dimension: limits.max_dimension,
            max_samples: limits.max_samples,
            max_steps: limits.max_steps,
            min_scale: limits.min_scale,
            max_scale: limits.max_scale,
        }
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from(&LimitsConfig::default())
    }
}

/// Header-level facts about an image.
struct Probe {
    format: ImageFormat,
    width: u32,
    height: u32,
}

pub struct RequestValidator {
    limits: ValidationLimits,
}

impl RequestValidator {
    pub fn new(limits: ValidationLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ValidationLimits {
        &self.limits
    }

    /// Validate a raw request.
    pub fn validate(&self, raw: RawProcessRequest) -> Result<ProcessingRequest, ValidationError> {
        // 1. presence and decodability
        let subject = present(ImageField::Subject, raw.subject)?;
        let garment = present(ImageField::Garment, raw.garment)?;
        let subject_probe = decode_header(ImageField::Subject, &subject.bytes)?;
        let garment_probe = decode_header(ImageField::Garment, &garment.bytes)?;

        // 2. size and dimension bounds
        self.check_bounds(ImageField::Subject, &subject.bytes, &subject_probe)?;
        self.check_bounds(ImageField::Garment, &garment.bytes, &garment_probe)?;

        // 3. content sniffing
        check_format(ImageField::Subject, &subject_probe)?;
        check_format(ImageField::Garment, &garment_probe)?;

        // 4. parameter ranges
        let samples = parse_int("samples", raw.samples.as_deref(), DEFAULT_SAMPLES as i64)?;
        check_range("samples", samples, 1, self.limits.max_samples as i64)?;

        let steps = parse_int("steps", raw.steps.as_deref(), DEFAULT_STEPS as i64)?;
        check_range("steps", steps, 1, self.limits.max_steps as i64)?;

        let scale = parse_scale(raw.scale.as_deref())?;
        if scale < self.limits.min_scale || scale > self.limits.max_scale {
            return Err(ValidationError::OutOfRange {
                parameter: "scale",
                value: scale.to_string(),
                min: self.limits.min_scale.to_string(),
                max: self.limits.max_scale.to_string(),
            });
        }

        let seed = parse_int("seed", raw.seed.as_deref(), DEFAULT_SEED)?;
        check_range("seed", seed, -1, MAX_SEED)?;

        let variant = match raw.variant.as_deref().map(str::trim) {
            None | Some("") => Variant::HalfBody,
            Some(value) => {
                Variant::parse(value).ok_or_else(|| ValidationError::UnknownVariant(value.to_string()))?
            }
        };

        let category = match raw.category.as_deref().map(str::trim) {
            None | Some("") => Category::UpperBody,
            Some(value) => parse_category(value)?,
        };

        // 5. pairing
        if !variant.accepts(category) {
            return Err(ValidationError::CategoryVariantMismatch { variant, category });
        }

        Ok(ProcessingRequest {
            id: Uuid::new_v4(),
            subject: ValidatedImage {
                bytes: subject.bytes,
                format: subject_probe.format,
                width: subject_probe.width,
                height: subject_probe.height,
            },
            garment: ValidatedImage {
                bytes: garment.bytes,
                format: garment_probe.format,
                width: garment_probe.width,
                height: garment_probe.height,
            },
            variant,
            category,
            params: SamplingParams {
                samples: samples as u32,
                steps: steps as u32,
                guidance_scale: scale,
                seed,
            },
            submitted_at: Utc::now(),
        })
    }

    fn check_bounds(&self, field: ImageField, bytes: &Bytes, probe: &Probe) -> Result<(), ValidationError> {
        if bytes.len() > self.limits.max_file_bytes {
            return Err(ValidationError::FileTooLarge {
                field,
                size: bytes.len(),
                max: self.limits.max_file_bytes,
            });
        }

        let (min, max) = (self.limits.min_dimension, self.limits.max_dimension);
        let in_bounds = |side: u32| side >= min && side <= max;
        if !in_bounds(probe.width) || !in_bounds(probe.height) {
            return Err(ValidationError::DimensionsOutOfBounds {
                field,
                width: probe.width,
                height: probe.height,
                min,
                max,
            });
        }
        Ok(())
    }
}

fn present(field: ImageField, image: Option<RawImage>) -> Result<RawImage, ValidationError> {
    let image = image.ok_or(ValidationError::MissingImage { field })?;
    if image.bytes.is_empty() {
        return Err(ValidationError::EmptyImage { field });
    }
    Ok(image)
}

/// Read format and dimensions from the header without decoding pixels.
fn decode_header(field: ImageField, bytes: &Bytes) -> Result<Probe, ValidationError> {
    let undecodable = |reason: String| ValidationError::UndecodableImage { field, reason };

    let reader = ImageReader::new(Cursor::new(bytes.as_ref()))
        .with_guessed_format()
        .map_err(|e| undecodable(e.to_string()))?;
    let format = reader
        .format()
        .ok_or_else(|| undecodable("unrecognized image data".to_string()))?;
    let (width, height) = reader
        .into_dimensions()
        .map_err(|e| undecodable(e.to_string()))?;

    Ok(Probe {
        format,
        width,
        height,
    })
}

fn check_format(field: ImageField, probe: &Probe) -> Result<(), ValidationError> {
    if ALLOWED_FORMATS.contains(&probe.format) {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedFormat {
            field,
            detected: format!("{:?}", probe.format).to_lowercase(),
        })
    }
}

fn parse_int(parameter: &'static str, value: Option<&str>, default: i64) -> Result<i64, ValidationError> {
    match value.map(str::trim) {
        None | Some("") => Ok(default),
        Some(text) => text.parse().map_err(|_| ValidationError::InvalidParameter {
            parameter,
            value: text.to_string(),
        }),
    }
}

fn check_range(parameter: &'static str, value: i64, min: i64, max: i64) -> Result<(), ValidationError> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            parameter,
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(())
}

fn parse_scale(value: Option<&str>) -> Result<f32, ValidationError> {
    match value.map(str::trim) {
        None | Some("") => Ok(DEFAULT_SCALE),
        Some(text) => match text.parse::<f32>() {
            Ok(scale) if scale.is_finite() => Ok(scale),
            _ => Err(ValidationError::InvalidParameter {
                parameter: "scale",
                value: text.to_string(),
            }),
        },
    }
}

/// Accepts the numeric code or the category name.
fn parse_category(value: &str) -> Result<Category, ValidationError> {
    let category = match value.parse::<i64>() {
        Ok(code) => Category::from_code(code),
        Err(_) => Category::from_name(value),
    };
    category.ok_or_else(|| ValidationError::UnknownCategory(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::encoded_image;

    fn validator() -> RequestValidator {
        RequestValidator::new(ValidationLimits::default())
    }

    fn request() -> RawProcessRequest {
        RawProcessRequest {
            subject: Some(RawImage::new(encoded_image(ImageFormat::Jpeg, 96, 128))),
            garment: Some(RawImage::new(encoded_image(ImageFormat::Jpeg, 96, 128))),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let validated = validator().validate(request()).unwrap();
        assert_eq!(validated.variant, Variant::HalfBody);
        assert_eq!(validated.category, Category::UpperBody);
        assert_eq!(
            validated.params,
            SamplingParams {
                samples: 1,
                steps: 20,
                guidance_scale: 2.0,
                seed: -1,
            }
        );
        assert_eq!(validated.subject.format, ImageFormat::Jpeg);
        assert_eq!((validated.subject.width, validated.subject.height), (96, 128));
    }

    #[test]
    fn test_missing_garment() {
        let mut raw = request();
        raw.garment = None;
        assert_eq!(
            validator().validate(raw).unwrap_err(),
            ValidationError::MissingImage {
                field: ImageField::Garment
            }
        );
    }

    #[test]
    fn test_garbage_bytes_are_undecodable() {
        let mut raw = request();
        raw.subject = Some(RawImage {
            bytes: Bytes::from_static(b"definitely not an image"),
            filename: Some("photo.jpg".to_string()),
            content_type: Some("image/jpeg".to_string()),
        });
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::UndecodableImage {
                field: ImageField::Subject,
                ..
            }
        ));
    }

    #[test]
    fn test_decodability_checked_before_parameters() {
        let mut raw = request();
        raw.garment = Some(RawImage::new(Bytes::from_static(b"\x00\x01")));
        raw.samples = Some("9".to_string());
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(err.code(), "undecodable_image");
    }

    #[test]
    fn test_dimension_bounds() {
        let mut raw = request();
        raw.subject = Some(RawImage::new(encoded_image(ImageFormat::Png, 32, 128)));
        let err = validator().validate(raw).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::DimensionsOutOfBounds { width: 32, .. }
        ));
    }

    #[test]
    fn test_file_size_limit() {
        let limits = ValidationLimits {
            max_file_bytes: 64,
            ..ValidationLimits::default()
        };
        let err = RequestValidator::new(limits).validate(request()).unwrap_err();
        assert!(matches!(err, ValidationError::FileTooLarge { max: 64, .. }));
    }

    #[test]
    fn test_format_is_sniffed_not_trusted() {
        // A GIF named like a JPEG is still a GIF.
        let mut raw = request();
        raw.garment = Some(RawImage {
            bytes: encoded_image(ImageFormat::Gif, 96, 128),
            filename: Some("garment.jpg".to_string()),
            content_type: Some("image/jpeg".to_string()),
        });
        let err = validator().validate(raw).unwrap_err();
        assert_eq!(
            err,
            ValidationError::UnsupportedFormat {
                field: ImageField::Garment,
                detected: "gif".to_string(),
            }
        );
    }

    #[test]
    fn test_parameter_ranges_are_not_coerced() {
        let cases = [
            ("samples", "0"),
            ("samples", "5"),
            ("steps", "41"),
            ("scale", "0.5"),
            ("scale", "5.5"),
            ("seed", "-2"),
            ("seed", "2147483648"),
        ];
        for (parameter, value) in cases {
            let mut raw = request();
            let slot = match parameter {
                "samples" => &mut raw.samples,
                "steps" => &mut raw.steps,
                "scale" => &mut raw.scale,
                _ => &mut raw.seed,
            };
            *slot = Some(value.to_string());

            let err = validator().validate(raw).unwrap_err();
            assert!(
                matches!(err, ValidationError::OutOfRange { parameter: p, .. } if p == parameter),
                "{parameter}={value}: {err}"
            );
        }
    }

    #[test]
    fn test_non_numeric_parameter() {
        let mut raw = request();
        raw.steps = Some("twenty".to_string());
        assert_eq!(validator().validate(raw).unwrap_err().code(), "invalid_parameter");

        let mut raw = request();
        raw.scale = Some("NaN".to_string());
        assert_eq!(validator().validate(raw).unwrap_err().code(), "invalid_parameter");
    }

    #[test]
    fn test_unknown_category_and_variant() {
        let mut raw = request();
        raw.category = Some("3".to_string());
        assert_eq!(
            validator().validate(raw).unwrap_err(),
            ValidationError::UnknownCategory("3".to_string())
        );

        let mut raw = request();
        raw.variant = Some("xl".to_string());
        assert_eq!(
            validator().validate(raw).unwrap_err(),
            ValidationError::UnknownVariant("xl".to_string())
        );
    }

    #[test]
    fn test_half_body_rejects_lower_body() {
        let mut raw = request();
        raw.variant = Some("hd".to_string());
        raw.category = Some("1".to_string());
        assert_eq!(
            validator().validate(raw).unwrap_err(),
            ValidationError::CategoryVariantMismatch {
                variant: Variant::HalfBody,
                category: Category::LowerBody,
            }
        );
    }

    #[test]
    fn test_full_body_accepts_dress_by_name() {
        let mut raw = request();
        raw.variant = Some("dc".to_string());
        raw.category = Some("dress".to_string());
        raw.samples = Some("4".to_string());
        raw.seed = Some("2147483647".to_string());

        let validated = validator().validate(raw).unwrap();
        assert_eq!(validated.variant, Variant::FullBody);
        assert_eq!(validated.category, Category::Dress);
        assert_eq!(validated.params.samples, 4);
        assert_eq!(validated.params.seed, MAX_SEED);
    }
}
