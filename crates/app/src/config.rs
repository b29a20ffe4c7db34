use perkwise_core::{BenefitCatalog, CatalogError};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catalog shipped with the binary, used when no `catalog` path is configured.
pub const BUILTIN_CATALOG: &str = include_str!("../catalog/benefits.toml");

pub const DATA_DIR_ENV: &str = "PERKWISE_DATA_DIR";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid benefit catalog: {0}")]
    Catalog(#[from] CatalogError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    /// File name of the user-state document inside `data_dir`.
    pub state_file: String,
    /// Benefit catalog to load instead of the built-in one.
    pub catalog: Option<PathBuf>,
    pub log_filter: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: project_dirs()
                .map(|dirs| dirs.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".perkwise")),
            state_file: "user-benefits.json".to_string(),
            catalog: None,
            log_filter: None,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "perkwise", "Perkwise")
}

impl Settings {
    /// `config.toml` in the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Loads settings from `path` (or the default location), then applies the
    /// data directory override from the environment. A missing file yields
    /// the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(Self::default_path);
        let settings = match path {
            Some(path) => Self::read(&path)?,
            None => Self::default(),
        };
        Ok(settings.with_data_dir_override(std::env::var_os(DATA_DIR_ENV)))
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn with_data_dir_override(mut self, data_dir: Option<OsString>) -> Self {
        if let Some(dir) = data_dir.filter(|d| !d.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join(&self.state_file)
    }

    pub fn load_catalog(&self) -> Result<BenefitCatalog, ConfigError> {
        match &self.catalog {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                Ok(BenefitCatalog::from_toml(&content)?)
            }
            None => Ok(BenefitCatalog::from_toml(BUILTIN_CATALOG)?),
        }
    }
}
