//! Configuration module
//!
//! Handles loading user settings for agents, sessions and workers.

#[allow(dead_code)]
mod settings;

pub use settings::*;
