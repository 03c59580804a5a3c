//! Configuration for [crate::updater::ParticleUpdater].
//!
//! The configuration holds plain, typed tuning values only. Measurement models and
//! resamplers are trait objects and are attached to the updater directly.
//!
//! Configurations can be written to and read from JSON, YAML, or TOML; the format is
//! chosen by file extension:
//!
//! ```toml
//! prediction_cache_capacity = 32
//! parallel = true
//! parallel_threshold = 2048
//! deadline_ms = 50
//! ```
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_cache_capacity() -> usize {
    16
}
fn default_parallel() -> bool {
    true
}
fn default_parallel_threshold() -> usize {
    1024
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Maximum number of measurement predictions retained. Least recently used entries are
    /// evicted first. Zero disables memoisation.
    #[serde(default = "default_cache_capacity")]
    pub prediction_cache_capacity: usize,

    /// Evaluate particle likelihoods on the rayon thread pool. Ignored when the crate is
    /// built without the `parallel` feature.
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Populations smaller than this are always weighted sequentially.
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,

    /// Time budget for the weighting stage of one update. When exceeded the update is
    /// abandoned and the prior is returned unchanged.
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        UpdaterConfig {
            prediction_cache_capacity: default_cache_capacity(),
            parallel: default_parallel(),
            parallel_threshold: default_parallel_threshold(),
            deadline_ms: None,
        }
    }
}

impl UpdaterConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }
    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
    /// Read the configuration from a JSON file.
    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        serde_json::from_reader(file).map_err(|e| ConfigError::Parse(e.to_string()))
    }
    /// Write the configuration as YAML.
    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from YAML.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file).map_err(|e| ConfigError::Parse(e.to_string()))
    }
    /// Write the configuration as TOML.
    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }
    /// Read the configuration from TOML.
    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| ConfigError::Parse(e.to_string()))
    }
    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => Self::from_json(p),
            Some("yaml") | Some("yml") => Self::from_yaml(p),
            Some("toml") => Self::from_toml(p),
            other => Err(ConfigError::UnsupportedFormat(
                other.unwrap_or("<none>").to_string(),
            )),
        }
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> UpdaterConfig {
        UpdaterConfig {
            prediction_cache_capacity: 4,
            parallel: false,
            parallel_threshold: 10,
            deadline_ms: Some(25),
        }
    }

    #[test]
    fn file_round_trip_all_formats() {
        let dir = tempdir().unwrap();
        for name in ["cfg.json", "cfg.yaml", "cfg.yml", "cfg.TOML"] {
            let path = dir.path().join(name);
            sample().to_file(&path).unwrap();
            assert_eq!(UpdaterConfig::from_file(&path).unwrap(), sample(), "{name}");
        }
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: UpdaterConfig = toml::from_str("deadline_ms = 5").unwrap();
        assert_eq!(cfg.prediction_cache_capacity, 16);
        assert!(cfg.parallel);
        assert_eq!(cfg.deadline(), Some(Duration::from_millis(5)));
        let empty: UpdaterConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, UpdaterConfig::default());
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let dir = tempdir().unwrap();
        let err = sample().to_file(dir.path().join("cfg.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == "ini"));
        let err = UpdaterConfig::from_file(dir.path().join("cfg")).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }
}
