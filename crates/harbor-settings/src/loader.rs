//! Settings loading: defaults ← file ← environment.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::{CredentialMode, HarborSettings};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Default settings file location: `$HARBOR_SETTINGS` or `~/.harbor/settings.toml`.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("HARBOR_SETTINGS") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".harbor")
        .join("settings.toml")
}

/// Loads, overlays, and persists [`HarborSettings`].
pub struct SettingsLoader {
    path: PathBuf,
}

impl SettingsLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn from_default_location() -> Self {
        Self::new(settings_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings: built-in defaults, then the file (if present), then
    /// environment variables. A `.env` file in the working directory is
    /// honored before the environment is read.
    pub fn load(&self) -> Result<HarborSettings, LoadError> {
        dotenvy::dotenv().ok();

        let mut settings = if self.path.exists() {
            let raw = std::fs::read_to_string(&self.path).map_err(|source| LoadError::Io {
                path: self.path.clone(),
                source,
            })?;
            let interpolated = interpolate_env(&raw);
            toml::from_str(&interpolated).map_err(|source| LoadError::Parse {
                path: self.path.clone(),
                source,
            })?
        } else {
            debug!(path = %self.path.display(), "no settings file, using defaults");
            HarborSettings::default()
        };

        apply_env_overrides(&mut settings);
        Ok(settings)
    }

    /// Write the settings file atomically (temp file + rename).
    pub fn save(&self, settings: &HarborSettings) -> Result<(), LoadError> {
        let text = toml::to_string_pretty(settings)?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LoadError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, &text).map_err(|source| LoadError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| LoadError::Io {
            path: self.path.clone(),
            source,
        })?;

        Ok(())
    }

    /// Write a default settings file on first run; leaves an existing file alone.
    pub fn ensure_template(&self) -> Result<(), LoadError> {
        if self.path.exists() {
            return Ok(());
        }
        self.save(&HarborSettings::default())
    }
}

/// Replace `$VAR` and `${VAR}` references with environment values.
///
/// Unknown variables are left untouched so the TOML parse error points at
/// the real problem instead of an empty string.
fn interpolate_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&next) = chars.peek() {
            if next.is_ascii_alphanumeric() || next == '_' {
                name.push(next);
                chars.next();
            } else {
                break;
            }
        }

        if braced {
            if chars.peek() == Some(&'}') {
                chars.next();
            } else {
                // Unterminated ${, emit verbatim
                out.push('$');
                out.push('{');
                out.push_str(&name);
                continue;
            }
        }

        if name.is_empty() {
            out.push('$');
            if braced {
                out.push('{');
                out.push('}');
            }
            continue;
        }

        match std::env::var(&name) {
            Ok(value) => out.push_str(&value),
            Err(_) => {
                out.push('$');
                if braced {
                    out.push('{');
                    out.push_str(&name);
                    out.push('}');
                } else {
                    out.push_str(&name);
                }
            }
        }
    }

    out
}

/// Overlay recognized environment variables onto the settings.
fn apply_env_overrides(settings: &mut HarborSettings) {
    if let Some(v) = env_parse::<usize>("MAX_CONCURRENT_SESSIONS") {
        settings.server.max_concurrent_sessions = v;
    }
    if let Some(v) = env_parse::<u64>("SESSION_IDLE_TIMEOUT") {
        settings.server.session_idle_timeout_secs = v;
    }
    if let Some(v) = env_parse::<u64>("TURN_TIMEOUT_DEFAULT") {
        settings.server.turn_timeout_default_secs = v;
    }
    if let Ok(v) = std::env::var("DATA_DIR") {
        settings.server.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LOG_LEVEL") {
        settings.server.log_level = v;
    }

    if let Ok(v) = std::env::var("SANDBOX_MEMORY_LIMIT") {
        settings.sandbox.memory_limit = v;
    }
    if let Some(v) = env_parse::<f64>("SANDBOX_CPU_QUOTA") {
        settings.sandbox.cpu_quota = v;
    }
    if let Ok(v) = std::env::var("SANDBOX_NETWORK_MODE") {
        settings.sandbox.network_mode = v;
    }
    if let Some(v) = env_parse::<usize>("SANDBOX_OP_CONCURRENCY") {
        settings.sandbox.op_concurrency = v;
    }
    if let Some(v) = env_parse::<u64>("SANDBOX_BUILD_TIMEOUT") {
        settings.sandbox.build_timeout_secs = v;
    }

    if let Some(v) = env_parse::<CredentialMode>("CREDENTIAL_MODE") {
        settings.auth.credential_mode = v;
    }
    if let Some(v) = env_parse::<bool>("PREFER_OAUTH") {
        settings.auth.prefer_oauth = v;
    }
    if let Some(v) = env_parse::<u64>("TOKEN_REFRESH_GUARD_SECONDS") {
        settings.auth.token_refresh_guard_secs = v;
    }
    if let Some(v) = env_parse::<u16>("CALLBACK_PORT_BASE") {
        settings.auth.callback_port_base = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(var = name, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn interpolates_braced_and_bare_vars() {
        std::env::set_var("HARBOR_TEST_INTERP", "filled");
        let input = "a = \"$HARBOR_TEST_INTERP\"\nb = \"${HARBOR_TEST_INTERP}/x\"";
        let out = interpolate_env(input);
        assert_eq!(out, "a = \"filled\"\nb = \"filled/x\"");
        std::env::remove_var("HARBOR_TEST_INTERP");
    }

    #[test]
    fn unknown_vars_stay_verbatim() {
        let input = "path = \"$HARBOR_TEST_MISSING_VAR\"";
        assert_eq!(interpolate_env(input), input);
    }

    #[test]
    fn lone_dollar_is_preserved() {
        assert_eq!(interpolate_env("cost = \"5$\""), "cost = \"5$\"");
    }

    #[test]
    #[serial]
    fn load_without_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let loader = SettingsLoader::new(dir.path().join("settings.toml"));
        let settings = loader.load().unwrap();
        assert_eq!(settings.server.max_concurrent_sessions, 20);
    }

    #[test]
    #[serial]
    fn file_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            "[server]\nmax_concurrent_sessions = 3\n\n[sandbox]\nnetwork_mode = \"harbor-net\"\n",
        )
        .unwrap();

        let settings = SettingsLoader::new(&path).load().unwrap();
        assert_eq!(settings.server.max_concurrent_sessions, 3);
        assert_eq!(settings.sandbox.network_mode, "harbor-net");
    }

    #[test]
    #[serial]
    fn env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[server]\nmax_concurrent_sessions = 3\n").unwrap();

        std::env::set_var("MAX_CONCURRENT_SESSIONS", "7");
        std::env::set_var("CREDENTIAL_MODE", "oauth");
        let settings = SettingsLoader::new(&path).load().unwrap();
        std::env::remove_var("MAX_CONCURRENT_SESSIONS");
        std::env::remove_var("CREDENTIAL_MODE");

        assert_eq!(settings.server.max_concurrent_sessions, 7);
        assert_eq!(settings.auth.credential_mode, CredentialMode::Oauth);
    }

    #[test]
    #[serial]
    fn bad_env_value_is_ignored() {
        let dir = TempDir::new().unwrap();
        let loader = SettingsLoader::new(dir.path().join("settings.toml"));

        std::env::set_var("SANDBOX_OP_CONCURRENCY", "many");
        let settings = loader.load().unwrap();
        std::env::remove_var("SANDBOX_OP_CONCURRENCY");

        assert_eq!(settings.sandbox.op_concurrency, 10);
    }

    #[test]
    #[serial]
    fn parse_error_points_at_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[server\n").unwrap();

        let err = SettingsLoader::new(&path).load().unwrap_err();
        assert!(matches!(err, LoadError::Parse { .. }));
    }

    #[test]
    #[serial]
    fn template_is_written_once_and_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.toml");
        let loader = SettingsLoader::new(&path);

        loader.ensure_template().unwrap();
        assert!(path.exists());
        let first = std::fs::read_to_string(&path).unwrap();

        // A second call must not clobber user edits.
        std::fs::write(&path, "[server]\nmax_concurrent_sessions = 2\n").unwrap();
        loader.ensure_template().unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(loader.load().unwrap().server.max_concurrent_sessions, 2);
    }

    #[test]
    #[serial]
    fn save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        let loader = SettingsLoader::new(&path);
        loader.save(&HarborSettings::default()).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("toml.tmp").exists());
    }
}
