// src/config/model.rs

use std::path::PathBuf;

use serde::Deserialize;

/// Optional settings file, as read from TOML.
///
/// ```toml
/// [master]
/// tries = 3
/// max_failures = 10
/// max_wall_time = 120.0
/// lock = true
/// resource_log = true
/// set_affinity = false
///
/// [worker]
/// host_memory = 16384
/// host_cpus = 8
/// strict_limits = true
/// host_script = "/opt/setup-node.sh"
/// host_script_timeout = 60
/// ```
///
/// Every key is optional. A key set here is used unless the matching
/// command-line flag is given.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSettings {
    #[serde(default)]
    pub master: MasterSection,

    #[serde(default)]
    pub worker: WorkerSection,
}

/// `[master]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MasterSection {
    pub tries: Option<u32>,
    /// 0 means unlimited.
    pub max_failures: Option<u32>,
    /// Minutes; 0 disables the budget.
    pub max_wall_time: Option<f64>,
    /// Lock the workflow file while running.
    pub lock: Option<bool>,
    pub resource_log: Option<bool>,
    pub set_affinity: Option<bool>,
    pub host_script: Option<PathBuf>,
}

/// `[worker]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerSection {
    /// MB; 0 means detect.
    pub host_memory: Option<u32>,
    /// 0 means detect.
    pub host_cpus: Option<u32>,
    pub strict_limits: Option<bool>,
    pub host_script: Option<PathBuf>,
    /// Seconds.
    pub host_script_timeout: Option<u64>,
}

/// A settings file that passed validation.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub master: MasterSection,
    pub worker: WorkerSection,
}

impl Settings {
    pub(crate) fn new_unchecked(master: MasterSection, worker: WorkerSection) -> Self {
        Self { master, worker }
    }
}
