// src/dag/rescue.rs

//! Rescue file reading.
//!
//! A rescue file is a flat list of `DONE <name>` lines, one per task that
//! already succeeded. Writing lives in [`crate::engine::rescue_log`].

use crate::errors::{ClusterError, Result};

/// Parse rescue text into `(line, task name)` pairs. Blank lines are skipped.
pub fn parse_rescue(text: &str) -> Result<Vec<(usize, String)>> {
    let mut done = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            continue;
        }
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        match fields.as_slice() {
            ["DONE", name] => done.push((line, name.to_string())),
            _ => {
                return Err(ClusterError::Rescue {
                    line,
                    message: format!("invalid rescue record '{trimmed}'"),
                });
            }
        }
    }
    Ok(done)
}
