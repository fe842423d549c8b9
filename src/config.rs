//! Capture configuration: defaults, TOML file loading, and environment overlay.

use crate::core_modules::dataset::SplitMode;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File looked up in the working directory when no explicit path is given.
pub const LOCAL_CONFIG_FILE: &str = "layercam.toml";

const ENV_PREFIX: &str = "LAYERCAM_";

/// Longest accepted pause between slots: one day.
pub const MAX_CYCLE_SECONDS: f64 = 86_400.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Everything the capture core reads from its environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Which dataset splits feed the pool.
    pub split_mode: SplitMode,
    /// Number of slots filled by one session.
    pub total_slots: usize,
    /// Pause after each filled slot, in seconds.
    pub cycle_seconds: f64,
    /// Highest layer number; `start` never counts past it.
    pub layer_total: u32,
    /// Only sample images that have a label file (falls back when none do).
    pub require_label: bool,
    /// Read-only dataset tree with `<split>/images` and `<split>/labels`.
    pub dataset_root: PathBuf,
    /// Managed tree the core writes copies, sheets and markers into.
    pub archive_root: PathBuf,
    /// SQLite file holding capture records.
    pub db_path: PathBuf,
    pub grid_rows: u32,
    pub grid_cols: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    /// Pixels between tiles of the contact sheet.
    pub grid_gap: u32,
    /// File extension (and so format) of the contact sheet.
    pub sheet_extension: String,
    /// Public URL prefix under which the archive root is served.
    pub url_prefix: String,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            split_mode: SplitMode::All,
            total_slots: 10,
            cycle_seconds: 5.0,
            layer_total: 32,
            require_label: true,
            dataset_root: PathBuf::from("static/dataset"),
            archive_root: PathBuf::from("static/capturas"),
            db_path: PathBuf::from("layercam.db"),
            grid_rows: 2,
            grid_cols: 5,
            tile_width: 320,
            tile_height: 180,
            grid_gap: 0,
            sheet_extension: "jpg".to_string(),
            url_prefix: "/static/capturas".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl CaptureConfig {
    /// Loads defaults, then the given file (or `layercam.toml` if present),
    /// then `LAYERCAM_*` environment variables, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let local = Path::new(LOCAL_CONFIG_FILE);
                if local.exists() {
                    Self::from_file(local)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents, path)
    }

    pub fn from_toml(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Overlays values found through `lookup`, keyed `LAYERCAM_<FIELD>`.
    /// Returns the names of the variables that were applied.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<Vec<String>, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();
        let mut get = |field: &str| {
            let key = format!("{ENV_PREFIX}{}", field.to_ascii_uppercase());
            let value = lookup(&key).filter(|v| !v.trim().is_empty());
            if value.is_some() {
                applied.push(key.clone());
            }
            value.map(|v| (key, v))
        };

        if let Some((key, v)) = get("split_mode") {
            self.split_mode = v.parse().map_err(|message| ConfigError::Invalid { key, message })?;
        }
        if let Some((key, v)) = get("total_slots") {
            self.total_slots = parse_number(&key, &v)?;
        }
        if let Some((key, v)) = get("cycle_seconds") {
            self.cycle_seconds = parse_number(&key, &v)?;
        }
        if let Some((key, v)) = get("layer_total") {
            self.layer_total = parse_number(&key, &v)?;
        }
        if let Some((key, v)) = get("require_label") {
            self.require_label = parse_bool(&key, &v)?;
        }
        if let Some((_, v)) = get("dataset_root") {
            self.dataset_root = PathBuf::from(v);
        }
        if let Some((_, v)) = get("archive_root") {
            self.archive_root = PathBuf::from(v);
        }
        if let Some((_, v)) = get("db_path") {
            self.db_path = PathBuf::from(v);
        }
        if let Some((_, v)) = get("log_filter") {
            self.log_filter = v;
        }

        Ok(applied)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: &str| ConfigError::Invalid {
            key: key.to_string(),
            message: message.to_string(),
        };

        if self.total_slots == 0 {
            return Err(invalid("total_slots", "must be at least 1"));
        }
        if self.layer_total == 0 {
            return Err(invalid("layer_total", "must be at least 1"));
        }
        if !(0.0..=MAX_CYCLE_SECONDS).contains(&self.cycle_seconds) {
            return Err(invalid("cycle_seconds", "must be between 0 and 86400"));
        }
        if self.grid_rows == 0 || self.grid_cols == 0 {
            return Err(invalid("grid_rows/grid_cols", "grid needs at least one row and column"));
        }
        if self.tile_width == 0 || self.tile_height == 0 {
            return Err(invalid("tile_width/tile_height", "tiles must be at least 1px"));
        }
        if image::ImageFormat::from_extension(&self.sheet_extension).is_none() {
            return Err(invalid("sheet_extension", "not a known image format"));
        }
        if self.archive_root.starts_with(&self.dataset_root)
            || self.dataset_root.starts_with(&self.archive_root)
        {
            return Err(invalid(
                "archive_root",
                "archive and dataset roots must be separate trees",
            ));
        }
        Ok(())
    }

    /// The per-slot pause. Never panics: negative or NaN reads as zero, and a
    /// value too large for `Duration` saturates.
    pub fn cycle(&self) -> Duration {
        Duration::try_from_secs_f64(self.cycle_seconds.max(0.0)).unwrap_or(Duration::MAX)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            key: key.to_string(),
            message: format!("'{other}' is not a boolean"),
        }),
    }
}
