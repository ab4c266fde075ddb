//! # classos-settings
//!
//! Configuration for the classos broker and agent, loaded from three layers
//! (in priority order):
//! 1. **Compiled defaults**: [`ClassosSettings::default()`]
//! 2. **User file**: `~/.classos/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `CLASSOS_*` overrides (highest priority)
//!
//! The merged result is validated before it is handed out.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::*;
