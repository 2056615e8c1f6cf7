//! Environment configuration.
//!
//! Loaded from YAML. Every field has a default, so an empty file (or no file
//! at all) describes the stock environment.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use stackline_core::DeployOptions;

use crate::error::{EnvError, EnvResult};

/// Config file picked up from the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "stackline.yaml";

/// Container images of the two services.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceImages {
    pub service01: String,
    pub service02: String,
}

impl Default for ServiceImages {
    fn default() -> Self {
        Self {
            service01: "name_image_docker".to_string(),
            service02: "name_image_docker2".to_string(),
        }
    }
}

/// Settings for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnvironmentConfig {
    /// Environment name, also used as the database instance identifier prefix.
    pub name: String,
    pub region: String,
    /// Where the local backend keeps its state file.
    pub state_dir: PathBuf,
    /// Where synthesized templates are written.
    pub output_dir: PathBuf,
    pub images: ServiceImages,
    /// Address subscribed to the product events topic, if any.
    pub topic_email: Option<String>,
    pub deploy: DeployOptions,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            name: "aws-project01".to_string(),
            region: "us-east-1".to_string(),
            state_dir: PathBuf::from(".stackline/state"),
            output_dir: PathBuf::from(".stackline/out"),
            images: ServiceImages::default(),
            topic_email: Some("teste@teste.com".to_string()),
            deploy: DeployOptions::default(),
        }
    }
}

impl EnvironmentConfig {
    /// Load a config from a YAML file.
    pub fn from_file(path: &Path) -> EnvResult<Self> {
        debug!("Loading environment config from {:?}", path);
        let content = fs::read_to_string(path)?;
        let config: Self = if content.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `stackline.yaml` in `dir` if it exists,
    /// else the defaults.
    pub fn discover(path: Option<&Path>, dir: &Path) -> EnvResult<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        let candidate = dir.join(DEFAULT_CONFIG_FILE);
        if candidate.exists() {
            info!("Using {:?}", candidate);
            Self::from_file(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Save the config as YAML.
    pub fn to_file(&self, path: &Path) -> EnvResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> EnvResult<()> {
        if self.name.trim().is_empty() {
            return Err(EnvError::InvalidConfig("name must not be empty".to_string()));
        }
        if self.region.trim().is_empty() {
            return Err(EnvError::InvalidConfig("region must not be empty".to_string()));
        }
        if self.deploy.parallelism == 0 {
            return Err(EnvError::InvalidConfig(
                "deploy.parallelism must be at least 1".to_string(),
            ));
        }
        if self.images.service01.is_empty() || self.images.service02.is_empty() {
            return Err(EnvError::InvalidConfig("service images must not be empty".to_string()));
        }
        Ok(())
    }

    /// Resolve relative directories against `base`.
    pub fn rooted_at(mut self, base: &Path) -> Self {
        if self.state_dir.is_relative() {
            self.state_dir = base.join(&self.state_dir);
        }
        if self.output_dir.is_relative() {
            self.output_dir = base.join(&self.output_dir);
        }
        if let Some(dir) = &self.deploy.log_dir {
            if dir.is_relative() {
                self.deploy.log_dir = Some(base.join(dir));
            }
        }
        self
    }
}
