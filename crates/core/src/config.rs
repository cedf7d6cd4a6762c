use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const SETTINGS_SCHEMA_VERSION: u32 = 1;

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * 1024;

pub const MIN_CHUNK_BYTES: u64 = 64 * KIB;
pub const MAX_CHUNK_BYTES: u64 = 16 * MIB;
pub const DEFAULT_CHUNK_BYTES: u64 = 500 * KIB;

pub const MIN_PARALLELISM: usize = 2;
pub const MAX_PARALLELISM: usize = 4;
pub const MAX_WORKERS: usize = 4;

pub const QUEUE_CAPACITY: usize = 8;
pub const SLICING_LANES: usize = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSettings {
    pub version: u32,
    #[serde(default)]
    pub controller: ControllerSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub initial_chunk_bytes: u64,
    pub min_chunk_bytes: u64,
    pub max_chunk_bytes: u64,
    pub initial_parallelism: usize,
    pub min_parallelism: usize,
    pub max_parallelism: usize,
    pub downscale_threshold_ms: u64,
    pub upscale_threshold_ms: u64,
    pub scale_step_percent: u32,
    pub eligible_ratio_percent: u32,
    pub parallelism_3_from_bytes: u64,
    pub parallelism_4_from_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub queue_capacity: usize,
    pub max_workers: usize,
    pub slicing_lanes: usize,
    pub reconcile_interval_ms: u64,
    pub backpressure_poll_ms: u64,
    pub backpressure_factor: usize,
    pub heartbeat_interval_ms: u64,
    pub attempt_timeout_per_mib_ms: u64,
    pub attempt_timeout_min_ms: u64,
    pub attempt_timeout_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetryPolicySettings::upload_default")]
    pub upload: RetryPolicySettings,
    #[serde(default = "RetryPolicySettings::assert_default")]
    pub assert: RetryPolicySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicySettings {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_SCHEMA_VERSION,
            controller: ControllerSettings::default(),
            pipeline: PipelineSettings::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            initial_chunk_bytes: DEFAULT_CHUNK_BYTES,
            min_chunk_bytes: MIN_CHUNK_BYTES,
            max_chunk_bytes: MAX_CHUNK_BYTES,
            initial_parallelism: MIN_PARALLELISM,
            min_parallelism: MIN_PARALLELISM,
            max_parallelism: MAX_PARALLELISM,
            downscale_threshold_ms: 30_000,
            upscale_threshold_ms: 25_000,
            scale_step_percent: 25,
            eligible_ratio_percent: 90,
            parallelism_3_from_bytes: 4 * MIB,
            parallelism_4_from_bytes: 8 * MIB,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: QUEUE_CAPACITY,
            max_workers: MAX_WORKERS,
            slicing_lanes: SLICING_LANES,
            reconcile_interval_ms: 200,
            backpressure_poll_ms: 50,
            backpressure_factor: 2,
            heartbeat_interval_ms: 30_000,
            attempt_timeout_per_mib_ms: 3_000,
            attempt_timeout_min_ms: 30_000,
            attempt_timeout_max_ms: 90_000,
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            upload: RetryPolicySettings::upload_default(),
            assert: RetryPolicySettings::assert_default(),
        }
    }
}

impl RetryPolicySettings {
    fn upload_default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
        }
    }

    fn assert_default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 5_000,
        }
    }
}

impl ControllerSettings {
    pub fn downscale_threshold(&self) -> Duration {
        Duration::from_millis(self.downscale_threshold_ms)
    }

    pub fn upscale_threshold(&self) -> Duration {
        Duration::from_millis(self.upscale_threshold_ms)
    }
}

impl PipelineSettings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_millis(self.reconcile_interval_ms)
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Per-attempt deadline: a fixed budget per started MiB, clamped to the configured window.
    pub fn attempt_timeout(&self, chunk_bytes: u64) -> Duration {
        let mib = chunk_bytes.div_ceil(MIB).max(1);
        let ms = self
            .attempt_timeout_per_mib_ms
            .saturating_mul(mib)
            .clamp(self.attempt_timeout_min_ms, self.attempt_timeout_max_ms);
        Duration::from_millis(ms)
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join("upload.toml")
}

pub fn load_settings(config_dir: &Path) -> Result<UploadSettings> {
    let path = config_path(config_dir);
    if !path.exists() {
        return Ok(UploadSettings::default());
    }

    let text = std::fs::read_to_string(&path).map_err(|e| Error::InvalidConfig {
        message: format!("config read failed: {e}"),
    })?;

    let settings = parse_settings(&text).map_err(|e| Error::InvalidConfig {
        message: format!("config invalid: {e}"),
    })?;
    validate_settings(&settings)?;
    Ok(settings)
}

pub fn parse_settings(text: &str) -> std::result::Result<UploadSettings, toml::de::Error> {
    let raw: toml::Value = toml::from_str(text)?;
    let version = raw
        .get("version")
        .and_then(|v| v.as_integer())
        .and_then(|v| u32::try_from(v).ok());

    match version {
        Some(SETTINGS_SCHEMA_VERSION) => toml::from_str::<UploadSettings>(text),
        Some(other) => Err(toml::de::Error::custom(format!(
            "unsupported settings schema version: {other} (expected {SETTINGS_SCHEMA_VERSION})"
        ))),
        None => Err(toml::de::Error::custom("missing settings schema version")),
    }
}

pub fn to_toml(settings: &UploadSettings) -> Result<String> {
    validate_settings(settings)?;
    toml::to_string(settings).map_err(|e| Error::InvalidConfig {
        message: format!("config encode failed: {e}"),
    })
}

pub fn save_settings(config_dir: &Path, settings: &UploadSettings) -> Result<()> {
    let text = to_toml(settings)?;

    let path = config_path(config_dir);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::InvalidConfig {
            message: format!("config dir create failed: {e}"),
        })?;
    }

    atomic_write(&path, text.as_bytes()).map_err(|e| Error::InvalidConfig {
        message: format!("config write failed: {e}"),
    })?;
    Ok(())
}

pub fn validate_settings(settings: &UploadSettings) -> Result<()> {
    if settings.version != SETTINGS_SCHEMA_VERSION {
        return Err(Error::InvalidConfig {
            message: format!(
                "settings.version must be {SETTINGS_SCHEMA_VERSION} (got {})",
                settings.version
            ),
        });
    }

    let c = &settings.controller;
    if c.min_chunk_bytes < MIN_CHUNK_BYTES || c.max_chunk_bytes > MAX_CHUNK_BYTES {
        return Err(Error::InvalidConfig {
            message: format!(
                "controller chunk bounds must stay within [{MIN_CHUNK_BYTES}, {MAX_CHUNK_BYTES}]"
            ),
        });
    }
    if !(c.min_chunk_bytes <= c.initial_chunk_bytes && c.initial_chunk_bytes <= c.max_chunk_bytes)
    {
        return Err(Error::InvalidConfig {
            message: "controller chunk sizes must satisfy min <= initial <= max".to_string(),
        });
    }
    if c.min_parallelism == 0 || c.max_parallelism > MAX_PARALLELISM {
        return Err(Error::InvalidConfig {
            message: format!("controller parallelism bounds must stay within [1, {MAX_PARALLELISM}]"),
        });
    }
    if !(c.min_parallelism <= c.initial_parallelism && c.initial_parallelism <= c.max_parallelism) {
        return Err(Error::InvalidConfig {
            message: "controller parallelism must satisfy min <= initial <= max".to_string(),
        });
    }
    if c.downscale_threshold_ms == 0 || c.upscale_threshold_ms == 0 {
        return Err(Error::InvalidConfig {
            message: "controller thresholds must be > 0".to_string(),
        });
    }
    if c.upscale_threshold_ms > c.downscale_threshold_ms {
        return Err(Error::InvalidConfig {
            message: "controller.upscale_threshold_ms must be <= downscale_threshold_ms".to_string(),
        });
    }
    if c.scale_step_percent == 0 || c.scale_step_percent >= 100 {
        return Err(Error::InvalidConfig {
            message: "controller.scale_step_percent must be in 1..=99".to_string(),
        });
    }
    if c.eligible_ratio_percent == 0 || c.eligible_ratio_percent > 100 {
        return Err(Error::InvalidConfig {
            message: "controller.eligible_ratio_percent must be in 1..=100".to_string(),
        });
    }

    let p = &settings.pipeline;
    if p.queue_capacity == 0 || p.slicing_lanes == 0 || p.backpressure_factor == 0 {
        return Err(Error::InvalidConfig {
            message: "pipeline queue_capacity, slicing_lanes and backpressure_factor must be > 0"
                .to_string(),
        });
    }
    if p.max_workers == 0 || p.max_workers > MAX_WORKERS {
        return Err(Error::InvalidConfig {
            message: format!("pipeline.max_workers must be in 1..={MAX_WORKERS}"),
        });
    }
    if p.reconcile_interval_ms == 0 || p.backpressure_poll_ms == 0 || p.heartbeat_interval_ms == 0
    {
        return Err(Error::InvalidConfig {
            message: "pipeline intervals must be > 0".to_string(),
        });
    }
    if p.attempt_timeout_min_ms == 0 || p.attempt_timeout_min_ms > p.attempt_timeout_max_ms {
        return Err(Error::InvalidConfig {
            message: "pipeline attempt timeouts must satisfy 0 < min <= max".to_string(),
        });
    }

    for (name, r) in [
        ("retry.upload", &settings.retry.upload),
        ("retry.assert", &settings.retry.assert),
    ] {
        if r.max_attempts == 0 {
            return Err(Error::InvalidConfig {
                message: format!("{name}.max_attempts must be >= 1"),
            });
        }
        if r.initial_backoff_ms > r.max_backoff_ms {
            return Err(Error::InvalidConfig {
                message: format!("{name}.initial_backoff_ms must be <= max_backoff_ms"),
            });
        }
    }

    Ok(())
}

fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        validate_settings(&UploadSettings::default()).unwrap();
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let input = r#"
version = 1

[controller]
initial_chunk_bytes = 1048576

[retry.upload]
max_attempts = 2
initial_backoff_ms = 10
max_backoff_ms = 20
"#;
        let s = parse_settings(input).unwrap();
        validate_settings(&s).unwrap();
        assert_eq!(s.controller.initial_chunk_bytes, MIB);
        assert_eq!(s.controller.max_parallelism, MAX_PARALLELISM);
        assert_eq!(s.pipeline.queue_capacity, QUEUE_CAPACITY);
        assert_eq!(s.retry.upload.max_attempts, 2);
        assert_eq!(s.retry.assert.max_attempts, 3);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let err = parse_settings("version = 7").unwrap_err();
        assert!(err.to_string().contains("unsupported settings schema version"));
        assert!(parse_settings("[controller]\nmin_parallelism = 2").is_err());
    }

    #[test]
    fn chunk_bounds_outside_hard_limits_are_rejected() {
        let mut s = UploadSettings::default();
        s.controller.max_chunk_bytes = 32 * MIB;
        assert!(validate_settings(&s).is_err());

        let mut s = UploadSettings::default();
        s.controller.initial_chunk_bytes = 32 * KIB;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn parallelism_above_cap_is_rejected() {
        let mut s = UploadSettings::default();
        s.controller.max_parallelism = 8;
        assert!(validate_settings(&s).is_err());

        let mut s = UploadSettings::default();
        s.pipeline.max_workers = 5;
        assert!(validate_settings(&s).is_err());
    }

    #[test]
    fn attempt_timeout_is_clamped() {
        let p = PipelineSettings::default();
        assert_eq!(p.attempt_timeout(500 * KIB), Duration::from_secs(30));
        assert_eq!(p.attempt_timeout(12 * MIB), Duration::from_secs(36));
        assert_eq!(p.attempt_timeout(12 * MIB + 1), Duration::from_secs(39));
        assert_eq!(p.attempt_timeout(64 * MIB), Duration::from_secs(90));
    }

    #[test]
    fn save_and_load_round_trip() {
        let temp = tempfile::tempdir().unwrap();
        let mut s = UploadSettings::default();
        s.pipeline.reconcile_interval_ms = 100;
        save_settings(temp.path(), &s).unwrap();

        let loaded = load_settings(temp.path()).unwrap();
        assert_eq!(loaded.pipeline.reconcile_interval_ms, 100);
        assert_eq!(loaded.controller.initial_chunk_bytes, DEFAULT_CHUNK_BYTES);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let s = load_settings(temp.path()).unwrap();
        assert_eq!(s.version, SETTINGS_SCHEMA_VERSION);
    }
}
