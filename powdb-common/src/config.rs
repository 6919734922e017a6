//! Configuration file discovery and TOML loading

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "POWDB_CONFIG";

/// Where a configuration file path came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Given on the command line
    CommandLine(PathBuf),
    /// Named by an environment variable
    Environment(PathBuf),
    /// Found at the platform default location
    UserDefault(PathBuf),
    /// No file: built-in defaults apply
    BuiltIn,
}

impl ConfigOrigin {
    /// Path of the configuration file, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigOrigin::CommandLine(p)
            | ConfigOrigin::Environment(p)
            | ConfigOrigin::UserDefault(p) => Some(p),
            ConfigOrigin::BuiltIn => None,
        }
    }

    /// True when the user explicitly asked for this file
    pub fn is_explicit(&self) -> bool {
        matches!(
            self,
            ConfigOrigin::CommandLine(_) | ConfigOrigin::Environment(_)
        )
    }
}

/// Configuration file resolution, in priority order:
/// 1. Command-line argument (highest priority)
/// 2. Environment variable
/// 3. `<user config dir>/powdb/<file_name>` if it exists
/// 4. Built-in defaults (no file)
pub fn resolve_config_path(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    file_name: &str,
) -> ConfigOrigin {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return ConfigOrigin::CommandLine(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return ConfigOrigin::Environment(PathBuf::from(path));
        }
    }

    // Priority 3: Platform config directory
    if let Some(path) = default_config_path(file_name) {
        if path.exists() {
            return ConfigOrigin::UserDefault(path);
        }
        debug!("No config file at {}", path.display());
    }

    ConfigOrigin::BuiltIn
}

/// Platform default config location (`~/.config/powdb/<file_name>` on Linux)
pub fn default_config_path(file_name: &str) -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("powdb").join(file_name))
}

/// Load a TOML document from the resolved origin
///
/// Built-in origin yields `T::default()`. An explicit path that does not exist
/// is an error; there is no silent fallback for a file the user asked for.
pub fn load_toml<T>(origin: &ConfigOrigin) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let Some(path) = origin.path() else {
        info!("No configuration file found, using built-in defaults");
        return Ok(T::default());
    };

    if !path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(path)?;
    let parsed = parse_toml(&content)?;
    info!("Configuration loaded from {}", path.display());
    Ok(parsed)
}

/// Parse a TOML string into `T`
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> Result<T> {
    Ok(toml::from_str(content)?)
}
