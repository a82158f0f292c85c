// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits;
use ::anyhow::{
    format_err,
    Error,
};
use ::std::{
    env,
    fs::File,
    io::Read,
    sync::OnceLock,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Process-wide configuration snapshot, installed by [Config::initialize].
static GLOBAL_CONFIG: OnceLock<Config> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime configuration.
///
/// Three knobs are consumed from the backing YAML document:
///
/// ```yaml
/// coroutine:
///   stack_size: 131072
/// tcp:
///   connect:
///     timeout: 5000
/// tcp_server:
///   read_timeout: 120000
/// ```
///
/// Environment variables `COROUTINE_STACK_SIZE`, `TCP_CONNECT_TIMEOUT` and
/// `TCP_SERVER_READ_TIMEOUT` override the file.
#[derive(Debug, Clone)]
pub struct Config {
    /// Task coroutine stack size (bytes).
    pub stack_size: usize,
    /// Default connect timeout when the caller set none (ms).
    pub connect_timeout_ms: u64,
    /// Read timeout installed on server-accepted sockets (ms).
    pub read_timeout_ms: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Config {
    /// Loads a configuration from a YAML file, applying environment overrides.
    pub fn from_file(config_path: &str) -> Result<Self, Error> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        let config = YamlLoader::load_from_str(&config_s)?;
        let config_obj: &Yaml = match &config[..] {
            [c] => c,
            _ => return Err(format_err!("wrong number of config objects")),
        };

        let mut config: Self = Self::default();
        if let Some(stack_size) = config_obj["coroutine"]["stack_size"].as_i64() {
            config.stack_size = stack_size as usize;
        }
        if let Some(timeout) = config_obj["tcp"]["connect"]["timeout"].as_i64() {
            config.connect_timeout_ms = timeout as u64;
        }
        if let Some(timeout) = config_obj["tcp_server"]["read_timeout"].as_i64() {
            config.read_timeout_ms = timeout as u64;
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Installs this configuration as the process-wide snapshot. Later calls
    /// are no-ops; the first installed snapshot wins.
    pub fn initialize(self) {
        let _ = GLOBAL_CONFIG.set(self);
    }

    /// Returns the process-wide configuration, falling back to defaults when
    /// no snapshot was installed.
    pub fn global() -> &'static Config {
        GLOBAL_CONFIG.get_or_init(|| {
            let mut config: Config = Config::default();
            config.apply_env_overrides();
            config
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("COROUTINE_STACK_SIZE") {
            if let Ok(v) = v.parse::<usize>() {
                self.stack_size = v;
            }
        }
        if let Ok(v) = env::var("TCP_CONNECT_TIMEOUT") {
            if let Ok(v) = v.parse::<u64>() {
                self.connect_timeout_ms = v;
            }
        }
        if let Ok(v) = env::var("TCP_SERVER_READ_TIMEOUT") {
            if let Ok(v) = v.parse::<u64>() {
                self.read_timeout_ms = v;
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: limits::DEFAULT_STACK_SIZE,
            connect_timeout_ms: limits::DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: limits::DEFAULT_SERVER_READ_TIMEOUT_MS,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::runtime::limits;
    use ::anyhow::Result;
    use ::std::io::Write;

    #[test]
    fn test_config_default() -> Result<()> {
        let config: Config = Config::default();
        crate::ensure_eq!(config.stack_size, limits::DEFAULT_STACK_SIZE);
        crate::ensure_eq!(config.connect_timeout_ms, limits::DEFAULT_CONNECT_TIMEOUT_MS);
        crate::ensure_eq!(config.read_timeout_ms, limits::DEFAULT_SERVER_READ_TIMEOUT_MS);
        Ok(())
    }

    #[test]
    fn test_config_from_file() -> Result<()> {
        let mut path = std::env::temp_dir();
        path.push(format!("weft-config-{}.yaml", std::process::id()));
        {
            let mut file = std::fs::File::create(&path)?;
            file.write_all(
                b"coroutine:\n  stack_size: 65536\ntcp:\n  connect:\n    timeout: 750\ntcp_server:\n  read_timeout: 30000\n",
            )?;
        }
        let config: Config = Config::from_file(path.to_str().unwrap())?;
        std::fs::remove_file(&path)?;
        crate::ensure_eq!(config.stack_size, 65536);
        crate::ensure_eq!(config.connect_timeout_ms, 750);
        crate::ensure_eq!(config.read_timeout_ms, 30000);
        Ok(())
    }
}
