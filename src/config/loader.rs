// src/config/loader.rs

use std::fs;
use std::path::Path;

use crate::config::model::{RawSettings, Settings};
use crate::errors::Result;

/// Read a settings file without validating it.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawSettings> {
    let contents = fs::read_to_string(path.as_ref())?;
    let settings: RawSettings = toml::from_str(&contents)?;
    Ok(settings)
}

/// Read and validate a settings file.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Settings> {
    let raw = load_from_path(path)?;
    Settings::try_from(raw)
}

/// Load `path` if one was given, otherwise use empty settings.
pub fn load_optional(path: Option<&Path>) -> Result<Settings> {
    match path {
        Some(path) => load_and_validate(path),
        None => Ok(Settings::default()),
    }
}
