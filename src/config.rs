//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::device::{DEFAULT_BY_ID_DIR, DEFAULT_SYS_BLOCK_DIR};
use crate::identity::LocalIdentity;
use crate::provider::{ApiVersion, InstanceId};

/// Block-device backend configuration derived from environment variables,
/// configuration files, and defaults.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "CINDERBLOCK",
    discovery(
        app_name = "cinderblock",
        env_var = "CINDERBLOCK_CONFIG_PATH",
        config_file_name = "cinderblock.toml",
        dotfile_name = ".cinderblock.toml",
        project_file_name = "cinderblock.toml"
    )
)]
pub struct CinderConfig {
    /// UUID of the cluster that owns the volumes this process manages.
    pub cluster_id: String,
    /// Pre-issued control-plane token sent as `X-Auth-Token`.
    pub auth_token: String,
    /// Block-storage endpoint including the project path.
    pub block_storage_url: String,
    /// Compute endpoint including the project path.
    pub compute_url: String,
    /// Block-storage API version (1 or 2).
    #[ortho_config(default = 2)]
    pub api_version: u8,
    /// Seconds to wait for a volume to converge.
    #[ortho_config(default = 300)]
    pub timeout_secs: u64,
    /// Seconds between polls.
    #[ortho_config(default = 1)]
    pub poll_interval_secs: u64,
    /// Directory of udev device-identity links.
    #[ortho_config(default = DEFAULT_BY_ID_DIR.to_owned())]
    pub device_by_id_dir: String,
    /// Sysfs block class directory used to identify `virtio_blk` disks.
    #[ortho_config(default = DEFAULT_SYS_BLOCK_DIR.to_owned())]
    pub sys_block_dir: String,
    /// Compute instance this node runs on. When unset the instance is found
    /// by matching the address used to reach `compute_url` against the
    /// compute server listing.
    pub instance_id: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to cinderblock.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

const REQUIRED_FIELDS: [FieldMetadata; 6] = [
    FieldMetadata::new("cluster identifier", "CINDERBLOCK_CLUSTER_ID", "cluster_id"),
    FieldMetadata::new("control-plane token", "CINDERBLOCK_AUTH_TOKEN", "auth_token"),
    FieldMetadata::new(
        "block-storage endpoint",
        "CINDERBLOCK_BLOCK_STORAGE_URL",
        "block_storage_url",
    ),
    FieldMetadata::new("compute endpoint", "CINDERBLOCK_COMPUTE_URL", "compute_url"),
    FieldMetadata::new(
        "device-identity directory",
        "CINDERBLOCK_DEVICE_BY_ID_DIR",
        "device_by_id_dir",
    ),
    FieldMetadata::new(
        "sysfs block directory",
        "CINDERBLOCK_SYS_BLOCK_DIR",
        "sys_block_dir",
    ),
];

impl CinderConfig {
    /// Loads configuration without parsing CLI arguments. Values merge
    /// defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("cinderblock")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation. Error messages include guidance on how
    /// to provide missing values via environment variables or configuration
    /// files.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is malformed.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let values = [
            &self.cluster_id,
            &self.auth_token,
            &self.block_storage_url,
            &self.compute_url,
            &self.device_by_id_dir,
            &self.sys_block_dir,
        ];
        for (value, metadata) in values.iter().zip(REQUIRED_FIELDS.iter()) {
            if value.trim().is_empty() {
                return Err(metadata.missing());
            }
        }
        self.cluster_uuid()?;
        self.api()?;
        self.identity()?;
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: String::from("poll_interval_secs"),
                message: String::from("must be at least one second"),
            });
        }
        Ok(())
    }

    /// Parses the configured cluster identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `cluster_id` is not a UUID.
    pub fn cluster_uuid(&self) -> Result<Uuid, ConfigError> {
        Uuid::parse_str(self.cluster_id.trim()).map_err(|err| ConfigError::Invalid {
            field: String::from("cluster_id"),
            message: err.to_string(),
        })
    }

    /// Returns the configured block-storage API version.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for versions other than 1 and 2.
    pub fn api(&self) -> Result<ApiVersion, ConfigError> {
        ApiVersion::try_from(self.api_version).map_err(|version| ConfigError::Invalid {
            field: String::from("api_version"),
            message: format!("unsupported version {version}; expected 1 or 2"),
        })
    }

    /// How the local compute instance is identified.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when no `instance_id` is set and
    /// `compute_url` has no host to route towards.
    pub fn identity(&self) -> Result<LocalIdentity, ConfigError> {
        if let Some(id) = self
            .instance_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            return Ok(LocalIdentity::Configured(InstanceId::from(id)));
        }
        let invalid = |message: String| ConfigError::Invalid {
            field: String::from("compute_url"),
            message,
        };
        let url = Url::parse(self.compute_url.trim()).map_err(|err| invalid(err.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| invalid(String::from("endpoint has no host")))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid(format!("no default port for scheme {}", url.scheme())))?;
        // `host_str` keeps IPv6 brackets, so the pair parses as a socket address.
        Ok(LocalIdentity::RouteTo(format!("{host}:{port}")))
    }

    /// Convergence timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Interval between polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field is present but unusable.
    #[error("invalid {field}: {message}")]
    Invalid {
        /// Offending field.
        field: String,
        /// Why the value was rejected.
        message: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// An HTTP client could not be constructed.
    #[error("cannot build HTTP client: {0}")]
    Client(String),
}
