//! Centralized TOML-based settings for the Harbor broker.
//!
//! Layering order, lowest priority first:
//! 1. Built-in defaults (every schema struct derives them)
//! 2. An optional settings file (`~/.harbor/settings.toml` by default)
//! 3. Process environment variables
//!
//! Settings values may reference environment variables with `$VAR` or
//! `${VAR}` syntax; interpolation happens before the TOML parse so it works
//! for any string-typed field. Writes go through a temp file + rename so a
//! crash never leaves a torn settings file behind.

pub mod loader;
pub mod schema;

pub use loader::{settings_path, LoadError, SettingsLoader};
pub use schema::{
    AssistantSettings, AuthSettings, CredentialMode, HarborSettings, SandboxSettings,
    ServerSettings,
};
