// ABOUTME: Configuration parsing for the init system.
// ABOUTME: Reads init.toml and TOML service files into typed config values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::runlevel::Runlevel;

pub const INIT_CONFIG_PATH: &str = "/etc/primus/init.toml";

fn default_runlevels() -> Vec<Runlevel> {
    [2, 3, 4, 5]
        .into_iter()
        .map(|n| Runlevel::new(n).unwrap())
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub exec: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Runlevels this service belongs to.
    #[serde(default = "default_runlevels")]
    pub runlevels: Vec<Runlevel>,
    /// The service reports readiness over the notify socket.
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl ServiceConfig {
    pub fn in_runlevel(&self, level: Runlevel) -> bool {
        self.runlevels.contains(&level)
    }
}

#[derive(Debug, Deserialize)]
struct ServiceFile {
    service: ServiceConfig,
}

/// Init-wide settings. Every field has a default so a missing or partial
/// init.toml is fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    pub default_runlevel: Runlevel,
    pub service_dir: PathBuf,
    pub session_log: PathBuf,
    pub notify_socket: PathBuf,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            default_runlevel: Runlevel::DEFAULT,
            service_dir: PathBuf::from("/etc/primus/services"),
            session_log: PathBuf::from("/var/log/primus/sessions"),
            notify_socket: PathBuf::from("/run/primus/notify"),
        }
    }
}

pub fn load_init_config(path: &Path) -> Result<InitConfig> {
    if !path.exists() {
        return Ok(InitConfig::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

pub fn parse_service(toml_str: &str) -> Result<ServiceConfig> {
    let file: ServiceFile = toml::from_str(toml_str).context("failed to parse service config")?;
    Ok(file.service)
}

pub fn load_services_from_dir(dir: &Path) -> Result<Vec<ServiceConfig>> {
    let mut services = Vec::new();

    if !dir.exists() {
        return Ok(services);
    }

    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read service directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "toml"))
        .collect();

    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config =
            parse_service(&content).with_context(|| format!("failed to parse {}", path.display()))?;
        services.push(config);
    }

    Ok(services)
}
