//! Compiler configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Knobs that change how plans are built, never what they return.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Allow index-nested-loop joins when the join is linear.
    pub streamed_joins: bool,
    /// Allow streamed optional matches when the left-join is linear.
    pub streamed_left_joins: bool,
    /// Rows remembered by the REDUCED stage.
    pub reduced_window: usize,
    /// Permit SERVICE evaluation at all.
    pub service_enabled: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            streamed_joins: true,
            streamed_left_joins: true,
            reduced_window: 1024,
            service_enabled: true,
        }
    }
}

impl CompilerConfig {
    /// Config that always materializes join and left-join right sides.
    pub fn materializing() -> Self {
        Self {
            streamed_joins: false,
            streamed_left_joins: false,
            ..Self::default()
        }
    }

    /// Reads `path`, falling back to defaults for absent keys.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `explicit`, else the default location if it exists, else defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => Self::load(path),
            None => match default_config_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    /// Renders the config as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }
}

/// Failures reading or writing compiler configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read compiler config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Config file is not valid TOML for [`CompilerConfig`].
    #[error("failed to parse compiler config {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
    /// Config could not be rendered.
    #[error("failed to serialize compiler config: {source}")]
    Serialize {
        /// Underlying TOML error.
        source: toml::ser::Error,
    },
}

/// `<config_dir>/sombra/algebra.toml`, when the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|base| base.join("sombra").join("algebra.toml"))
}
