//! kubebuild CLI configuration stored at `~/.kubebuild/config.json`.
//!
//! Every builder setting resolves with the same precedence (highest first):
//! 1. Command line flag
//! 2. `KUBEBUILD_*` environment variable (read by clap)
//! 3. `~/.kubebuild/config.json`
//! 4. Built-in default
//!
//! The namespace has no built-in default; it falls back to the kubeconfig
//! context's namespace.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kubebuild_common::DEFAULT_BUILDKIT_IMAGE;
use kubebuild_driver::kubernetes::DEFAULT_RUNTIME_SOCKET;

use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".kubebuild";
const CONFIG_FILE_NAME: &str = "config.json";

/// Builder name used when none is configured
pub const DEFAULT_BUILDER_NAME: &str = "kubebuild";

/// Persistent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct KubebuildConfig {
    /// Builder selected with `kubebuild bootstrap --use`.
    pub builder: Option<String>,
    /// Namespace builders live in.
    pub namespace: Option<String>,
    /// buildkitd image for new builders.
    pub image: Option<String>,
    /// Kubeconfig to use instead of the kube default.
    pub kubeconfig: Option<String>,
    /// Initial replicas for new builders.
    pub replicas: Option<i32>,
    /// Container runtime socket inside builder pods.
    pub runtime_socket: Option<String>,
}

/// Command line values for the builder settings; `None` means not given.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub image: Option<String>,
    pub kubeconfig: Option<String>,
    pub replicas: Option<i32>,
}

/// Fully resolved builder settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderSettings {
    pub name: String,
    /// `None` defers to the kubeconfig context's namespace
    pub namespace: Option<String>,
    pub image: String,
    pub kubeconfig: Option<PathBuf>,
    pub replicas: i32,
    pub runtime_socket: String,
}

impl KubebuildConfig {
    /// Merge command line overrides over this file configuration.
    pub fn resolve(&self, overrides: &Overrides) -> Result<BuilderSettings> {
        let replicas = overrides.replicas.or(self.replicas).unwrap_or(1);
        if replicas < 1 {
            return Err(Error::validation(format!(
                "replicas must be at least 1, got {}",
                replicas
            )));
        }

        Ok(BuilderSettings {
            name: pick(&overrides.name, &self.builder)
                .unwrap_or_else(|| DEFAULT_BUILDER_NAME.to_string()),
            namespace: pick(&overrides.namespace, &self.namespace),
            image: pick(&overrides.image, &self.image)
                .unwrap_or_else(|| DEFAULT_BUILDKIT_IMAGE.to_string()),
            kubeconfig: pick(&overrides.kubeconfig, &self.kubeconfig).map(PathBuf::from),
            replicas,
            runtime_socket: self
                .runtime_socket
                .clone()
                .unwrap_or_else(|| DEFAULT_RUNTIME_SOCKET.to_string()),
        })
    }
}

fn pick(flag: &Option<String>, file: &Option<String>) -> Option<String> {
    flag.iter()
        .chain(file.iter())
        .find(|v| !v.is_empty())
        .cloned()
}

/// Returns `~/.kubebuild/`, creating it if it doesn't exist.
pub fn kubebuild_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
    let dir = home.join(CONFIG_DIR_NAME);
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            Error::command_failed(format!("failed to create {}: {}", dir.display(), e))
        })?;
    }
    Ok(dir)
}

/// Path to `~/.kubebuild/config.json`.
pub fn config_path() -> Result<PathBuf> {
    Ok(kubebuild_dir()?.join(CONFIG_FILE_NAME))
}

/// Load config from `~/.kubebuild/config.json`, returning default if missing.
pub fn load_config() -> Result<KubebuildConfig> {
    load_config_from(&config_path()?)
}

/// Save config to `~/.kubebuild/config.json`.
pub fn save_config(config: &KubebuildConfig) -> Result<()> {
    save_config_to(&config_path()?, config)
}

fn load_config_from(path: &Path) -> Result<KubebuildConfig> {
    if !path.exists() {
        return Ok(KubebuildConfig::default());
    }
    let data = std::fs::read_to_string(path)?;
    serde_json::from_str(&data).map_err(|e| Error::InvalidConfig {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn save_config_to(path: &Path, config: &KubebuildConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data)
        .map_err(|e| Error::command_failed(format!("failed to write {}: {}", path.display(), e)))
}
