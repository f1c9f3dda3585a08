//! Configuration for the try-on server.
//!
//! The configuration is loaded once at startup, validated, and then handed to
//! each component as resolved values. Nothing reads the environment after
//! [`Config::load`] returns.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigBuilder, Environment, File, FileFormat};
use serde::Deserialize;
use tryon_common::Variant;

/// Hard cap on samples per request.
pub const MAX_SAMPLES_CAP: u32 = 4;
/// Hard cap on diffusion steps per request.
pub const MAX_STEPS_CAP: u32 = 40;

/// Main configuration structure for the try-on server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub variants: VariantsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Deployment environment name (production, development, testing).
    #[serde(default = "default_environment")]
    pub environment: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
        }
    }
}

/// Numeric precision the models are loaded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float16,
    Bfloat16,
    Float32,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float16 => "float16",
            Precision::Bfloat16 => "bfloat16",
            Precision::Float32 => "float32",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorConfig {
    /// Declared accelerator devices, e.g. `["cuda:0", "cuda:1"]`.
    #[serde(default = "default_devices")]
    pub devices: Vec<String>,
    #[serde(default = "default_precision")]
    pub precision: Precision,
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            devices: default_devices(),
            precision: default_precision(),
        }
    }
}

/// Per-variant model configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct VariantConfig {
    /// Checkpoint directory, relative to `models.checkpoints_dir`.
    pub checkpoint: String,
    /// Device this variant is pinned to. Defaults to the first declared device.
    #[serde(default)]
    pub device: Option<String>,
    /// Whether health reports `down` when this variant cannot be loaded.
    #[serde(default = "default_true")]
    pub required: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariantsConfig {
    #[serde(default = "default_hd_variant")]
    pub hd: VariantConfig,
    #[serde(default = "default_dc_variant")]
    pub dc: VariantConfig,
}

impl Default for VariantsConfig {
    fn default() -> Self {
        Self {
            hd: default_hd_variant(),
            dc: default_dc_variant(),
        }
    }
}

impl VariantsConfig {
    pub fn get(&self, variant: Variant) -> &VariantConfig {
        match variant {
            Variant::HalfBody => &self.hd,
            Variant::FullBody => &self.dc,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Jobs admitted at once (queued plus running), across all devices.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Maximum HTTP request body size in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
    /// Maximum size of a single uploaded image in bytes.
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: usize,
    #[serde(default = "default_min_dimension")]
    pub min_dimension: u32,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_max_samples")]
    pub max_samples: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_min_scale")]
    pub min_scale: f32,
    #[serde(default = "default_max_scale")]
    pub max_scale: f32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_request_bytes: default_max_request_bytes(),
            max_file_bytes: default_max_file_bytes(),
            min_dimension: default_min_dimension(),
            max_dimension: default_max_dimension(),
            max_samples: default_max_samples(),
            max_steps: default_max_steps(),
            min_scale: default_min_scale(),
            max_scale: default_max_scale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Base URL of the pipeline worker service.
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_parse_timeout")]
    pub parse_timeout_secs: u64,
    #[serde(default = "default_pose_timeout")]
    pub pose_timeout_secs: u64,
    #[serde(default = "default_synthesize_timeout")]
    pub synthesize_timeout_secs: u64,
    #[serde(default = "default_postprocess_timeout")]
    pub postprocess_timeout_secs: u64,
    /// Wall-clock budget for a whole job, queue time included.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    /// Interval between accelerator reachability probes.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_output_width")]
    pub output_width: u32,
    #[serde(default = "default_output_height")]
    pub output_height: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            parse_timeout_secs: default_parse_timeout(),
            pose_timeout_secs: default_pose_timeout(),
            synthesize_timeout_secs: default_synthesize_timeout(),
            postprocess_timeout_secs: default_postprocess_timeout(),
            job_timeout_secs: default_job_timeout(),
            probe_interval_secs: default_probe_interval(),
            output_width: default_output_width(),
            output_height: default_output_height(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_checkpoints_dir")]
    pub checkpoints_dir: String,
    /// Checkpoint directories shared by every variant (parsing, pose, CLIP).
    #[serde(default = "default_shared_checkpoints")]
    pub shared_checkpoints: Vec<String>,
    /// Load every variant in the background at startup.
    #[serde(default = "default_true")]
    pub preload: bool,
    #[serde(default = "default_load_timeout")]
    pub load_timeout_secs: u64,
    /// How long a failed load is remembered before the next demand retries.
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown_secs: u64,
    /// Total load attempts per variant before it is considered permanently failed.
    #[serde(default = "default_max_load_attempts")]
    pub max_load_attempts: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            checkpoints_dir: default_checkpoints_dir(),
            shared_checkpoints: default_shared_checkpoints(),
            preload: true,
            load_timeout_secs: default_load_timeout(),
            retry_cooldown_secs: default_retry_cooldown(),
            max_load_attempts: default_max_load_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResultsConfig {
    #[serde(default = "default_results_dir")]
    pub dir: String,
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            dir: default_results_dir(),
            retention_secs: default_retention(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory for structured JSON log files. Stdout only when unset.
    #[serde(default = "default_log_dir")]
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    7865
}
fn default_environment() -> String {
    "production".to_string()
}
fn default_devices() -> Vec<String> {
    vec!["cuda:0".to_string()]
}
fn default_precision() -> Precision {
    Precision::Float16
}
fn default_hd_variant() -> VariantConfig {
    VariantConfig {
        checkpoint: "ootd/ootd_hd".to_string(),
        device: None,
        required: true,
    }
}
fn default_dc_variant() -> VariantConfig {
    VariantConfig {
        checkpoint: "ootd/ootd_dc".to_string(),
        device: None,
        required: true,
    }
}
fn default_max_concurrent_jobs() -> usize {
    1
}
fn default_max_request_bytes() -> usize {
    50 * 1024 * 1024
}
fn default_max_file_bytes() -> usize {
    10 * 1024 * 1024
}
fn default_min_dimension() -> u32 {
    64
}
fn default_max_dimension() -> u32 {
    4096
}
fn default_max_samples() -> u32 {
    MAX_SAMPLES_CAP
}
fn default_max_steps() -> u32 {
    MAX_STEPS_CAP
}
fn default_min_scale() -> f32 {
    1.0
}
fn default_max_scale() -> f32 {
    5.0
}
fn default_backend_url() -> String {
    "http://127.0.0.1:7866".to_string()
}
fn default_parse_timeout() -> u64 {
    30
}
fn default_pose_timeout() -> u64 {
    30
}
fn default_synthesize_timeout() -> u64 {
    240
}
fn default_postprocess_timeout() -> u64 {
    30
}
fn default_job_timeout() -> u64 {
    300
}
fn default_probe_interval() -> u64 {
    15
}
fn default_output_width() -> u32 {
    768
}
fn default_output_height() -> u32 {
    1024
}
fn default_checkpoints_dir() -> String {
    "checkpoints".to_string()
}
fn default_shared_checkpoints() -> Vec<String> {
    vec![
        "humanparsing".to_string(),
        "openpose".to_string(),
        "clip-vit-large-patch14".to_string(),
    ]
}
fn default_load_timeout() -> u64 {
    300
}
fn default_retry_cooldown() -> u64 {
    30
}
fn default_max_load_attempts() -> u32 {
    3
}
fn default_results_dir() -> String {
    "outputs/results".to_string()
}
fn default_retention() -> u64 {
    24 * 60 * 60
}
fn default_sweep_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> Option<String> {
    Some("logs".to_string())
}
fn default_true() -> bool {
    true
}

/// Configuration errors. Any of these prevents the process from starting.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Required path for {name} does not exist: {path}")]
    MissingPath { name: String, path: String },

    #[error("Option {option} is out of range: {value} (expected {expected})")]
    OutOfRange {
        option: &'static str,
        value: String,
        expected: String,
    },

    #[error("Conflicting options: {0}")]
    Conflict(String),
}

fn out_of_range(option: &'static str, value: impl ToString, expected: impl ToString) -> ConfigError {
    ConfigError::OutOfRange {
        option,
        value: value.to_string(),
        expected: expected.to_string(),
    }
}

impl Config {
    /// Load configuration from file and environment variables, then validate it.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (TRYON__SECTION__KEY format)
    /// 2. config.toml file (if present, path overridable with TRYON_CONFIG)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TRYON_CONFIG").unwrap_or_else(|_| "config".to_string());
        let builder = ConfigLoader::builder()
            .add_source(File::with_name(&path).required(false))
            .add_source(
                Environment::with_prefix("TRYON")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("accelerator.devices")
                    .with_list_parse_key("models.shared_checkpoints"),
            );
        Self::build(builder)
    }

    /// Load configuration from a TOML document, then validate it.
    pub fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::build(ConfigLoader::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    fn build(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let config: Config = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges, conflicts and required paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(out_of_range("server.port", 0, "1-65535"));
        }

        let devices = &self.accelerator.devices;
        if devices.is_empty() {
            return Err(out_of_range("accelerator.devices", "[]", "at least one device"));
        }
        let unique: HashSet<&String> = devices.iter().collect();
        if unique.len() != devices.len() {
            return Err(ConfigError::Conflict(format!(
                "accelerator.devices lists a device twice: {:?}",
                devices
            )));
        }

        let limits = &self.limits;
        if limits.max_concurrent_jobs == 0 {
            return Err(out_of_range("limits.max_concurrent_jobs", 0, ">= 1"));
        }
        if limits.max_concurrent_jobs > devices.len() {
            return Err(ConfigError::Conflict(format!(
                "limits.max_concurrent_jobs ({}) exceeds the number of declared accelerator devices ({})",
                limits.max_concurrent_jobs,
                devices.len()
            )));
        }
        if limits.max_file_bytes == 0 {
            return Err(out_of_range("limits.max_file_bytes", 0, ">= 1"));
        }
        if limits.max_file_bytes > limits.max_request_bytes {
            return Err(ConfigError::Conflict(format!(
                "limits.max_file_bytes ({}) exceeds limits.max_request_bytes ({})",
                limits.max_file_bytes, limits.max_request_bytes
            )));
        }
        if limits.min_dimension == 0 || limits.min_dimension > limits.max_dimension {
            return Err(out_of_range(
                "limits.min_dimension",
                limits.min_dimension,
                format!("1-{}", limits.max_dimension),
            ));
        }
        if limits.max_samples == 0 || limits.max_samples > MAX_SAMPLES_CAP {
            return Err(out_of_range(
                "limits.max_samples",
                limits.max_samples,
                format!("1-{}", MAX_SAMPLES_CAP),
            ));
        }
        if limits.max_steps == 0 || limits.max_steps > MAX_STEPS_CAP {
            return Err(out_of_range(
                "limits.max_steps",
                limits.max_steps,
                format!("1-{}", MAX_STEPS_CAP),
            ));
        }
        if !(limits.min_scale > 0.0 && limits.min_scale <= limits.max_scale) {
            return Err(out_of_range(
                "limits.min_scale",
                limits.min_scale,
                format!("0 < min_scale <= {}", limits.max_scale),
            ));
        }

        let pipeline = &self.pipeline;
        for (option, value) in [
            ("pipeline.parse_timeout_secs", pipeline.parse_timeout_secs),
            ("pipeline.pose_timeout_secs", pipeline.pose_timeout_secs),
            ("pipeline.synthesize_timeout_secs", pipeline.synthesize_timeout_secs),
            ("pipeline.postprocess_timeout_secs", pipeline.postprocess_timeout_secs),
            ("pipeline.job_timeout_secs", pipeline.job_timeout_secs),
            ("pipeline.probe_interval_secs", pipeline.probe_interval_secs),
            ("models.load_timeout_secs", self.models.load_timeout_secs),
            ("results.retention_secs", self.results.retention_secs),
            ("results.sweep_interval_secs", self.results.sweep_interval_secs),
        ] {
            if value == 0 {
                return Err(out_of_range(option, 0, ">= 1"));
            }
        }
        if pipeline.output_width == 0 || pipeline.output_height == 0 {
            return Err(out_of_range(
                "pipeline.output_width/output_height",
                format!("{}x{}", pipeline.output_width, pipeline.output_height),
                "non-zero",
            ));
        }
        if self.models.max_load_attempts == 0 {
            return Err(out_of_range("models.max_load_attempts", 0, ">= 1"));
        }

        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(out_of_range(
                "logging.level",
                &self.logging.level,
                "trace, debug, info, warn or error",
            ));
        }

        for variant in Variant::ALL {
            let device = self.variant_device(variant);
            if !devices.iter().any(|d| d == device) {
                return Err(ConfigError::Conflict(format!(
                    "variant {} is pinned to undeclared device {}",
                    variant, device
                )));
            }
        }

        self.check_paths()
    }

    fn check_paths(&self) -> Result<(), ConfigError> {
        let checkpoints = self.checkpoints_dir();
        require_dir("models.checkpoints_dir", &checkpoints)?;

        for shared in &self.models.shared_checkpoints {
            require_dir(&format!("checkpoint {}", shared), &checkpoints.join(shared))?;
        }
        for variant in Variant::ALL {
            require_dir(
                &format!("variant {} checkpoint", variant),
                &self.checkpoint_path(variant),
            )?;
        }
        Ok(())
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        PathBuf::from(&self.models.checkpoints_dir)
    }

    pub fn checkpoint_path(&self, variant: Variant) -> PathBuf {
        self.checkpoints_dir()
            .join(&self.variants.get(variant).checkpoint)
    }

    /// Device a variant runs on.
    pub fn variant_device(&self, variant: Variant) -> &str {
        self.variants
            .get(variant)
            .device
            .as_deref()
            .unwrap_or_else(|| self.accelerator.devices[0].as_str())
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.job_timeout_secs)
    }
}

fn require_dir(name: &str, path: &Path) -> Result<(), ConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::MissingPath {
            name: name.to_string(),
            path: path.display().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a checkpoint tree with every required directory.
    fn checkpoint_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for sub in [
            "humanparsing",
            "openpose",
            "clip-vit-large-patch14",
            "ootd/ootd_hd",
            "ootd/ootd_dc",
        ] {
            std::fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        dir
    }

    fn toml_with(dir: &tempfile::TempDir, extra: &str) -> String {
        format!(
            "[models]\ncheckpoints_dir = \"{}\"\n{}",
            dir.path().display().to_string().replace('\\', "/"),
            extra
        )
    }

    #[test]
    fn test_default_server_config() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 7865);
        assert_eq!(server.environment, "production");
    }

    #[test]
    fn test_default_limits_match_hard_caps() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.max_concurrent_jobs, 1);
        assert_eq!(limits.max_samples, 4);
        assert_eq!(limits.max_steps, 40);
        assert_eq!(limits.min_scale, 1.0);
        assert_eq!(limits.max_scale, 5.0);
    }

    #[test]
    fn test_load_valid_config() {
        let dir = checkpoint_tree();
        let config = Config::from_toml(&toml_with(
            &dir,
            "[accelerator]\ndevices = [\"cuda:0\", \"cuda:1\"]\nprecision = \"bfloat16\"\n\
             [variants.dc]\ncheckpoint = \"ootd/ootd_dc\"\ndevice = \"cuda:1\"\n",
        ))
        .unwrap();

        assert_eq!(config.accelerator.precision, Precision::Bfloat16);
        assert_eq!(config.variant_device(Variant::HalfBody), "cuda:0");
        assert_eq!(config.variant_device(Variant::FullBody), "cuda:1");
        assert!(config.checkpoint_path(Variant::HalfBody).ends_with("ootd/ootd_hd"));
    }

    #[test]
    fn test_concurrency_exceeding_devices_is_a_conflict() {
        let dir = checkpoint_tree();
        let err = Config::from_toml(&toml_with(&dir, "[limits]\nmax_concurrent_jobs = 2\n"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)), "{err}");
    }

    #[test]
    fn test_missing_checkpoint_fails_fast() {
        let dir = checkpoint_tree();
        std::fs::remove_dir_all(dir.path().join("openpose")).unwrap();
        let err = Config::from_toml(&toml_with(&dir, "")).unwrap_err();
        assert!(matches!(err, ConfigError::MissingPath { .. }), "{err}");
    }

    #[test]
    fn test_out_of_range_values_are_rejected() {
        let dir = checkpoint_tree();
        for extra in [
            "[limits]\nmax_steps = 41\n",
            "[limits]\nmax_samples = 0\n",
            "[limits]\nmin_scale = 6.0\n",
            "[pipeline]\nsynthesize_timeout_secs = 0\n",
            "[logging]\nlevel = \"chatty\"\n",
        ] {
            let err = Config::from_toml(&toml_with(&dir, extra)).unwrap_err();
            assert!(matches!(err, ConfigError::OutOfRange { .. }), "{extra}: {err}");
        }
    }

    #[test]
    fn test_unknown_precision_is_rejected() {
        let dir = checkpoint_tree();
        let err = Config::from_toml(&toml_with(&dir, "[accelerator]\nprecision = \"int3\"\n"))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Load(_)), "{err}");
    }

    #[test]
    fn test_variant_on_undeclared_device_is_a_conflict() {
        let dir = checkpoint_tree();
        let err = Config::from_toml(&toml_with(
            &dir,
            "[variants.hd]\ncheckpoint = \"ootd/ootd_hd\"\ndevice = \"cuda:7\"\n",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Conflict(_)), "{err}");
    }
}
