// src/engine/mod.rs

//! Readiness engine wrapped around a [`crate::dag::Dag`].
//!
//! [`core`] decides which tasks may be offered to the scheduler and applies
//! results (success, retry, terminal failure, failure budget).
//! [`rescue_log`] persists every success as it happens.

pub mod core;
pub mod rescue_log;

pub use core::{Engine, EngineOptions};
pub use rescue_log::RescueLog;
