//! Settings loading
//!
//! Priority (highest to lowest):
//! 1. Environment variables (`VOCAST__SECTION__KEY`)
//! 2. The file given with `--config`, or `vocast.toml` in the user config dir
//! 3. Built-in defaults

use config::{Config, ConfigError, Environment, File};
use std::path::{Path, PathBuf};
use tracing::debug;
use vocast_core::Settings;

pub const ENV_PREFIX: &str = "VOCAST";

/// `<config dir>/vocast/vocast.toml`
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("vocast").join("vocast.toml"))
}

/// Load settings; an explicit `path` must exist, the default one may not
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    load_with_prefix(path, ENV_PREFIX)
}

fn load_with_prefix(path: Option<&Path>, prefix: &str) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    match path {
        Some(path) => {
            builder = builder.add_source(File::from(path).required(true));
        }
        None => {
            if let Some(path) = default_path() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix(prefix)
            .separator("__")
            .try_parsing(true),
    );

    let settings: Settings = builder.build()?.try_deserialize()?;
    settings
        .validate()
        .map_err(|e| ConfigError::Message(e.to_string()))?;
    debug!("Loaded settings: {:?}", settings);
    Ok(settings)
}
