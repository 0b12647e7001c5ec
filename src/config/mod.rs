//! Engine configuration.
//!
//! Everything that used to be a process-wide switch (run mode, access logging,
//! the monitor hook, compression) is a field on [`EngineConfig`], handed to
//! [`Engine::new`](crate::engine::Engine::new) and read from there on.
//!
//! ```toml
//! mode = "production"
//! compression = true
//! static_dir = "public"
//! index_file = "index.html"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on urlencoded form bodies (5 MiB).
pub const DEFAULT_MAX_FORM_SIZE: usize = 5 << 20;

/// Errors produced while loading or validating an [`EngineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("static directory {0} does not exist or is not a directory")]
    StaticDir(PathBuf),

    #[error("index file name {0:?} must be a bare file name")]
    IndexFile(String),
}

/// Run mode. Controls how much failure detail reaches the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Debug,
    Testing,
    Production,
}

/// Engine-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: Mode,
    /// Emit one access-log event per request.
    pub log: bool,
    /// Invoke the installed monitor around each dispatch.
    pub monitor: bool,
    /// Compress responses for clients that accept gzip or deflate.
    pub compression: bool,
    /// Serve files from this directory before consulting the route table.
    pub static_dir: Option<PathBuf>,
    pub index_file: String,
    pub max_form_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            log: true,
            monitor: false,
            compression: false,
            static_dir: None,
            index_file: "index.html".to_owned(),
            max_form_size: DEFAULT_MAX_FORM_SIZE,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed TOML, or any error from
    /// [`validate`](Self::validate).
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Read`] if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks that the static directory exists and the index name is usable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::StaticDir`] or [`ConfigError::IndexFile`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(dir) = &self.static_dir {
            if !dir.is_dir() {
                return Err(ConfigError::StaticDir(dir.clone()));
            }
        }
        if self.index_file.is_empty() || self.index_file.contains('/') {
            return Err(ConfigError::IndexFile(self.index_file.clone()));
        }
        Ok(())
    }

    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn log(mut self, enabled: bool) -> Self {
        self.log = enabled;
        self
    }

    #[must_use]
    pub fn monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    #[must_use]
    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    #[must_use]
    pub fn static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn index_file(mut self, name: impl Into<String>) -> Self {
        self.index_file = name.into();
        self
    }

    #[must_use]
    pub fn max_form_size(mut self, bytes: usize) -> Self {
        self.max_form_size = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.mode, Mode::Debug);
        assert!(c.log);
        assert!(!c.monitor);
        assert!(!c.compression);
        assert_eq!(c.index_file, "index.html");
        assert_eq!(c.max_form_size, 5 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let c = EngineConfig::from_toml_str("mode = \"production\"\ncompression = true\n").unwrap();
        assert_eq!(c.mode, Mode::Production);
        assert!(c.compression);
        assert!(c.log);
        assert!(c.static_dir.is_none());
    }

    #[test]
    fn rejects_missing_static_dir() {
        let err = EngineConfig::from_toml_str("static_dir = \"/definitely/not/here\"").unwrap_err();
        assert!(matches!(err, ConfigError::StaticDir(_)));
    }

    #[test]
    fn rejects_nested_index_file() {
        let err = EngineConfig::default().index_file("a/index.html").validate().unwrap_err();
        assert!(matches!(err, ConfigError::IndexFile(_)));
    }

    #[test]
    fn rejects_bad_toml() {
        let err = EngineConfig::from_toml_str("mode = 3").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let body = format!("static_dir = {:?}\nlog = false\n", dir.path());
        fs::write(&path, body).unwrap();
        let c = EngineConfig::from_file(&path).unwrap();
        assert!(!c.log);
        assert_eq!(c.static_dir.as_deref(), Some(dir.path()));
        assert!(matches!(
            EngineConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
