// src/config/mod.rs

//! Optional TOML settings file.
//!
//! - `model.rs`: the `[master]` / `[worker]` data model.
//! - `loader.rs`: reading from disk.
//! - `validate.rs`: range checks.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, load_optional};
pub use model::{MasterSection, RawSettings, Settings, WorkerSection};
pub use validate::validate_settings;
