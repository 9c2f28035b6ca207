//! Deserialized configuration file contents
//!
//! An optional `esploader.toml` in the user's configuration directory,
//! currently only holding a default serial port so it does not have to be
//! passed on every invocation.

use std::{fs, path::PathBuf};

use directories::ProjectDirs;
use log::{debug, warn};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
pub struct Connection {
    /// Default serial port
    pub serial: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: Connection,
}

impl Config {
    /// Loads the configuration, falling back to defaults when there is no
    /// usable file.
    pub fn load() -> Self {
        let path = match Self::path() {
            Some(path) if path.exists() => path,
            _ => return Config::default(),
        };

        let parsed = fs::read_to_string(&path)
            .map_err(|err| err.to_string())
            .and_then(|content| toml::from_str(&content).map_err(|err| err.to_string()));

        match parsed {
            Ok(config) => {
                debug!("using configuration from {}", path.display());
                config
            }
            Err(err) => {
                warn!(
                    "ignoring invalid configuration file {}: {}",
                    path.display(),
                    err
                );
                Config::default()
            }
        }
    }

    fn path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "esploader")
            .map(|dirs| dirs.config_dir().join("esploader.toml"))
    }
}
