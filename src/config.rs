use crate::events::DiffStrategy;
use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub webserver: Webserver,
    pub database: Database,
    /// Namespaces (or glob patterns) to track. Empty or `*` tracks every namespace.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub diff_strategy: DiffStrategy,
    /// Cron expression for the periodic full resync. Disabled when absent.
    pub resync_schedule: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Deserialize)]
pub struct Database {
    pub path: PathBuf,
}

impl Config {
    /// The single namespace to scope watch requests to, when exactly one literal name is configured.
    pub fn single_namespace(&self) -> Option<&str> {
        match self.namespaces.as_slice() {
            [namespace] if !namespace.contains(['*', '?', '[', '{']) => Some(namespace.as_str()),
            _ => None,
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut result = String::with_capacity(input.len());
    let mut last = 0;
    for caps in re.captures_iter(input) {
        let (Some(placeholder), Some(var_name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = env::var(var_name.as_str())
            .with_context(|| format!("Missing environment variable: {}", var_name.as_str()))?;
        result.push_str(&input[last..placeholder.start()]);
        result.push_str(&value);
        last = placeholder.end();
    }
    result.push_str(&input[last..]);

    Ok(result)
}
