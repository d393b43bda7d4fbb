//! Process-wide settings of the intake pipeline, read from TOML.
//!
//! ```toml
//! max-package-size = 1073741824
//! package-format = "zip"
//!
//! [resource-pool]
//! root = "/var/vcap/data/resource_pool"
//! minimum-size = 1
//! maximum-size = 536870912
//!
//! [concurrency]
//! blocking-tasks = 8
//! ```
//!
//! Every key is optional. The configuration is a plain value that is handed to
//! [`crate::PackageIntake::new`], nothing is read from global state.

use std::path::{Path, PathBuf};

use droplet_resource_pool::LocalResourcePool;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::ArchiveFormat;

/// 1 GiB, the default package size budget.
fn default_max_package_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_minimum_size() -> u64 {
    1
}

/// 512 MiB. Larger files are cheaper to upload again than to keep around.
fn default_maximum_size() -> u64 {
    512 * 1024 * 1024
}

/// Defaulting to the number of CPUs available.
fn default_blocking_tasks() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZero::get)
}

#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error while reading the configuration file.
    #[error("IO error while reading configuration file '{}'", .path.display())]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Error parsing the configuration file.
    #[error("Error parsing configuration file: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid value for a field.
    #[error("Invalid value for field {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IntakeConfig {
    /// The largest total uncompressed size in bytes an application package may have.
    #[serde(default = "default_max_package_size")]
    pub max_package_size: u64,

    /// The format packages are repacked into when the caller does not ask for one.
    #[serde(default)]
    pub package_format: ArchiveFormat,

    #[serde(default)]
    pub resource_pool: ResourcePoolConfig,

    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            max_package_size: default_max_package_size(),
            package_format: ArchiveFormat::default(),
            resource_pool: ResourcePoolConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourcePoolConfig {
    /// Directory of the local resource pool. Without it no pool is opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,

    /// Files smaller than this are not added to or matched from the pool.
    // The defaults are repeated on the fields so a partially specified table does not fall back
    // to zero.
    #[serde(default = "default_minimum_size")]
    pub minimum_size: u64,

    /// Files larger than this are not added to or matched from the pool.
    #[serde(default = "default_maximum_size")]
    pub maximum_size: u64,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            root: None,
            minimum_size: default_minimum_size(),
            maximum_size: default_maximum_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConcurrencyConfig {
    /// The maximum number of archive and filesystem operations that run at once.
    #[serde(default = "default_blocking_tasks")]
    pub blocking_tasks: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            blocking_tasks: default_blocking_tasks(),
        }
    }
}

impl IntakeConfig {
    /// Parses and validates a configuration.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: IntakeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the configuration file at `path`.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs_err::read_to_string(path).map_err(|source| ConfigError::IoError {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency.blocking_tasks == 0 {
            return Err(ConfigError::InvalidValue(
                "concurrency.blocking-tasks".to_string(),
                "The number of concurrent blocking tasks must be greater than 0".to_string(),
            ));
        }

        if self.resource_pool.minimum_size > self.resource_pool.maximum_size {
            return Err(ConfigError::InvalidValue(
                "resource-pool.minimum-size".to_string(),
                format!(
                    "The minimum size ({}) must not be larger than the maximum size ({})",
                    self.resource_pool.minimum_size, self.resource_pool.maximum_size
                ),
            ));
        }

        Ok(())
    }

    /// Opens the local resource pool described by the `[resource-pool]` table, if a root is
    /// configured.
    pub fn open_resource_pool(&self) -> Option<LocalResourcePool> {
        let pool = &self.resource_pool;
        pool.root.as_ref().map(|root| {
            LocalResourcePool::new(root).with_size_window(pool.minimum_size, pool.maximum_size)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = IntakeConfig::from_toml_str("").unwrap();
        assert_eq!(config, IntakeConfig::default());
        assert_eq!(config.max_package_size, 1_073_741_824);
        assert_eq!(config.package_format, ArchiveFormat::Zip);
        assert_eq!(config.resource_pool.minimum_size, 1);
        assert_eq!(config.resource_pool.maximum_size, 536_870_912);
        assert!(config.concurrency.blocking_tasks >= 1);
        assert!(config.open_resource_pool().is_none());
    }

    #[test]
    fn test_full_config() {
        let config = IntakeConfig::from_toml_str(
            r#"
            max-package-size = 2048
            package-format = "tar"

            [resource-pool]
            root = "/var/vcap/data/resource_pool"
            maximum-size = 4096

            [concurrency]
            blocking-tasks = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.max_package_size, 2048);
        assert_eq!(config.package_format, ArchiveFormat::Tar);
        // Unspecified keys of a partially specified table keep their defaults.
        assert_eq!(config.resource_pool.minimum_size, 1);
        assert_eq!(config.resource_pool.maximum_size, 4096);
        assert_eq!(config.concurrency.blocking_tasks, 3);

        let pool = config.open_resource_pool().unwrap();
        assert_eq!(pool.root(), Path::new("/var/vcap/data/resource_pool"));
    }

    #[test]
    fn test_invalid_values() {
        assert_matches!(
            IntakeConfig::from_toml_str("[concurrency]\nblocking-tasks = 0"),
            Err(ConfigError::InvalidValue(field, _)) if field == "concurrency.blocking-tasks"
        );
        assert_matches!(
            IntakeConfig::from_toml_str("[resource-pool]\nminimum-size = 10\nmaximum-size = 5"),
            Err(ConfigError::InvalidValue(field, _)) if field == "resource-pool.minimum-size"
        );
        assert_matches!(
            IntakeConfig::from_toml_str("package-format = \"rar\""),
            Err(ConfigError::ParseError(_))
        );
        assert_matches!(
            IntakeConfig::from_toml_str("max-package-size = -1"),
            Err(ConfigError::ParseError(_))
        );
    }

    #[test]
    fn test_from_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("intake.toml");
        std::fs::write(&path, "max-package-size = 10").unwrap();
        assert_eq!(IntakeConfig::from_path(&path).unwrap().max_package_size, 10);

        assert_matches!(
            IntakeConfig::from_path(temp_dir.path().join("missing.toml")),
            Err(ConfigError::IoError { .. })
        );
    }
}
