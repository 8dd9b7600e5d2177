// src/config/validate.rs

use crate::config::model::{RawSettings, Settings};
use crate::errors::{ClusterError, Result};

impl TryFrom<RawSettings> for Settings {
    type Error = ClusterError;

    fn try_from(raw: RawSettings) -> std::result::Result<Self, Self::Error> {
        validate_settings(&raw)?;
        Ok(Settings::new_unchecked(raw.master, raw.worker))
    }
}

pub fn validate_settings(raw: &RawSettings) -> Result<()> {
    validate_master(raw)?;
    validate_worker(raw)?;
    Ok(())
}

fn validate_master(raw: &RawSettings) -> Result<()> {
    if raw.master.tries == Some(0) {
        return Err(ClusterError::ConfigError(
            "[master].tries must be >= 1 (got 0)".to_string(),
        ));
    }

    if let Some(minutes) = raw.master.max_wall_time {
        if !minutes.is_finite() || minutes < 0.0 {
            return Err(ClusterError::ConfigError(format!(
                "[master].max_wall_time must be a non-negative number of minutes (got {minutes})"
            )));
        }
    }

    Ok(())
}

fn validate_worker(raw: &RawSettings) -> Result<()> {
    if raw.worker.host_script_timeout == Some(0) {
        return Err(ClusterError::ConfigError(
            "[worker].host_script_timeout must be >= 1 second (got 0)".to_string(),
        ));
    }
    Ok(())
}
