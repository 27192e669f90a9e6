//! Factory configuration that downstream crates can serialize/deserialize.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    /// Directory for scratch files.
    pub temp_dir: PathBuf,

    /// Prefix for every scratch file name (used by the leftover sweep).
    pub file_prefix: String,

    /// Largest object (in bytes) that may live in RAM. Anything bigger starts on disk.
    pub max_ram_per_object: u64,

    /// Hard RAM ceiling (in bytes) across all live RAM-tier objects.
    pub max_ram_total: u64,

    /// Reservation used for growable buckets created without a size hint.
    pub default_bucket_estimate: u64,

    /// Encrypt scratch files at rest with a per-file key.
    pub encrypt_on_disk: bool,

    /// Hand file deletion to the background runner instead of deleting inline.
    pub async_delete: bool,

    /// Route over-quota objects to disk. When false, creation fails with `QuotaExceeded`.
    pub disk_fallback: bool,

    /// Maximum number of pooled file handles kept open at once.
    pub max_open_files: usize,

    /// Fraction of `max_ram_total` above which a relief pass is scheduled.
    pub pressure_high_watermark: f64,

    /// Fraction of `max_ram_total` a relief pass migrates down to.
    pub pressure_low_watermark: f64,

    /// RAM-tier objects older than this are migrated by the next relief pass.
    pub ram_max_age_secs: u64,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("tierstore"),
            file_prefix: "temp-".to_string(),
            max_ram_per_object: 64 * 1024,
            max_ram_total: 32 * 1024 * 1024, // 32 MiB default
            default_bucket_estimate: 4096,
            encrypt_on_disk: false,
            async_delete: false,
            disk_fallback: true,
            max_open_files: 64,
            pressure_high_watermark: 0.9,
            pressure_low_watermark: 0.8,
            ram_max_age_secs: 300,
        }
    }
}

impl FactoryConfig {
    /// Defaults overridden by `TIERSTORE_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("TIERSTORE_TEMP_DIR") {
            cfg.temp_dir = PathBuf::from(s);
        }

        if let Ok(s) = std::env::var("TIERSTORE_FILE_PREFIX") {
            cfg.file_prefix = s;
        }

        if let Some(v) = env_parse::<u64>("TIERSTORE_MAX_RAM_PER_OBJECT") {
            cfg.max_ram_per_object = v;
        }

        if let Some(v) = env_parse::<u64>("TIERSTORE_MAX_RAM_TOTAL") {
            cfg.max_ram_total = v;
        }

        if let Some(v) = env_parse::<u64>("TIERSTORE_DEFAULT_BUCKET_ESTIMATE") {
            cfg.default_bucket_estimate = v;
        }

        if let Some(v) = env_parse::<bool>("TIERSTORE_ENCRYPT_ON_DISK") {
            cfg.encrypt_on_disk = v;
        }

        if let Some(v) = env_parse::<bool>("TIERSTORE_ASYNC_DELETE") {
            cfg.async_delete = v;
        }

        if let Some(v) = env_parse::<bool>("TIERSTORE_DISK_FALLBACK") {
            cfg.disk_fallback = v;
        }

        if let Some(v) = env_parse::<usize>("TIERSTORE_MAX_OPEN_FILES") {
            cfg.max_open_files = v;
        }

        if let Some(v) = env_parse::<f64>("TIERSTORE_PRESSURE_HIGH") {
            cfg.pressure_high_watermark = v;
        }

        if let Some(v) = env_parse::<f64>("TIERSTORE_PRESSURE_LOW") {
            cfg.pressure_low_watermark = v;
        }

        if let Some(v) = env_parse::<u64>("TIERSTORE_RAM_MAX_AGE_SECS") {
            cfg.ram_max_age_secs = v;
        }

        cfg
    }

    /// Load a JSON config file. Missing fields fall back to defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let cfg: Self = serde_json::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.pressure_high_watermark) || !in_unit(self.pressure_low_watermark) {
            return Err(Error::Config(format!(
                "watermarks must be in (0, 1], got high={} low={}",
                self.pressure_high_watermark, self.pressure_low_watermark
            )));
        }
        if self.pressure_low_watermark > self.pressure_high_watermark {
            return Err(Error::Config(
                "pressure_low_watermark exceeds pressure_high_watermark".into(),
            ));
        }
        if self.max_ram_per_object > self.max_ram_total {
            return Err(Error::Config(format!(
                "max_ram_per_object {} exceeds max_ram_total {}",
                self.max_ram_per_object, self.max_ram_total
            )));
        }
        if self.max_open_files == 0 {
            return Err(Error::Config("max_open_files must be at least 1".into()));
        }
        if self.file_prefix.is_empty() || self.file_prefix.contains(|c: char| c == '/' || c == '\\') {
            return Err(Error::Config(format!(
                "invalid file_prefix '{}'",
                self.file_prefix
            )));
        }
        Ok(())
    }

    /// RAM usage above which a relief pass is scheduled.
    pub fn high_watermark_bytes(&self) -> u64 {
        (self.max_ram_total as f64 * self.pressure_high_watermark) as u64
    }

    /// RAM usage a relief pass migrates down to.
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.max_ram_total as f64 * self.pressure_low_watermark) as u64
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
