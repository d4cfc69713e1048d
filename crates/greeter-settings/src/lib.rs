//! # greeter-settings
//!
//! Settings for the greeter daemon, loaded from three layers in priority
//! order:
//! 1. **Compiled defaults** ([`GreeterSettings::default()`])
//! 2. **User file** `~/.greeter/settings.json`, deep-merged over defaults
//! 3. **Environment variables** `GREETER_*` (highest priority)
//!
//! Command-line flags, applied by the daemon, sit above all three.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings,
    load_settings_from_path, settings_path, validate,
};
pub use types::{GreeterSettings, LoggingSettings, ServerSettings};
