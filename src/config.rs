//! Configuration loading and persistence.
//!
//! Values are layered: built-in defaults, then `config.json` in the config
//! directory, then `QUACK_*` environment variables, then CLI flags (applied
//! by the binary). The client token is never written to disk.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, str::FromStr};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::client::{SessionOptions, ThrottleOptions};
use crate::constants::{
    BACKOFF_FACTOR, DEDUP_WINDOW, DEFAULT_BIND_ADDR, RATE_LIMIT, RECONNECT_MAX_INTERVAL,
    RECONNECT_MIN_INTERVAL, RESEND_INTERVAL,
};
use crate::notification::Credential;
use crate::server::ServerOptions;
use crate::transport::TransportPreference;

const CONFIG_FILE: &str = "config.json";

/// Configuration shared by `quack serve` and `quack listen`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Requested transport kind.
    pub transport_kind: TransportPreference,
    /// Notification endpoint for `listen`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Reconnect after transport failures.
    pub reconnect: bool,
    /// First reconnect delay in milliseconds.
    pub reconnect_min_interval_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_interval_ms: u64,
    /// Growth factor of the reconnect delay.
    pub backoff_factor: f64,
    /// Minimum spacing between presented notifications, in milliseconds.
    pub rate_limit_ms: u64,
    /// Duplicate-suppression window in milliseconds.
    pub dedup_window_ms: u64,
    /// Redelivery interval of pending notifications, in milliseconds.
    pub resend_interval_ms: u64,
    /// Server listen address.
    pub bind: String,
    /// Login sent in the auth handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
    /// Token sent in the auth handshake. NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transport_kind: TransportPreference::Auto,
            url: None,
            reconnect: true,
            reconnect_min_interval_ms: millis(RECONNECT_MIN_INTERVAL),
            reconnect_max_interval_ms: millis(RECONNECT_MAX_INTERVAL),
            backoff_factor: BACKOFF_FACTOR,
            rate_limit_ms: millis(RATE_LIMIT),
            dedup_window_ms: millis(DEDUP_WINDOW),
            resend_interval_ms: millis(RESEND_INTERVAL),
            bind: DEFAULT_BIND_ADDR.to_string(),
            login: None,
            token: None,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Config {
    /// Configuration directory.
    ///
    /// `QUACK_CONFIG_DIR` overrides the platform config dir
    /// (e.g. `~/.config/quack`).
    ///
    /// # Errors
    ///
    /// Returns an error if the platform has no config directory and the
    /// override is unset.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("QUACK_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("quack"))
    }

    /// Load from the config directory, then apply environment overrides.
    ///
    /// A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be determined or
    /// the file is unreadable or malformed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load `config.json` from `dir` without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Apply `QUACK_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply `QUACK_*` overrides read through `lookup`.
    ///
    /// Values that fail to parse are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QUACK_URL") {
            self.url = Some(url).filter(|u| !u.is_empty());
        }
        override_parsed(&lookup, "QUACK_TRANSPORT", &mut self.transport_kind);
        override_parsed(&lookup, "QUACK_RECONNECT", &mut self.reconnect);
        override_parsed(&lookup, "QUACK_RECONNECT_MIN_MS", &mut self.reconnect_min_interval_ms);
        override_parsed(&lookup, "QUACK_RECONNECT_MAX_MS", &mut self.reconnect_max_interval_ms);
        override_parsed(&lookup, "QUACK_BACKOFF_FACTOR", &mut self.backoff_factor);
        override_parsed(&lookup, "QUACK_RATE_LIMIT_MS", &mut self.rate_limit_ms);
        override_parsed(&lookup, "QUACK_DEDUP_WINDOW_MS", &mut self.dedup_window_ms);
        override_parsed(&lookup, "QUACK_RESEND_INTERVAL_MS", &mut self.resend_interval_ms);
        if let Some(bind) = lookup("QUACK_BIND") {
            self.bind = bind;
        }
        if let Some(login) = lookup("QUACK_LOGIN") {
            self.login = Some(login).filter(|l| !l.is_empty());
        }
        // Token from env var only; never read from or written to the file.
        if let Some(token) = lookup("QUACK_TOKEN") {
            self.token = Some(token).filter(|t| !t.is_empty());
        }
    }

    /// Persist to the config directory.
    ///
    /// # Errors
    ///
    /// Same as [`Config::config_dir`] and [`Config::save_to`].
    pub fn save(&self) -> Result<PathBuf> {
        let dir = Self::config_dir()?;
        self.save_to(&dir)?;
        Ok(dir.join(CONFIG_FILE))
    }

    /// Persist `config.json` into `dir`, owner read/write only.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written or restricted.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Credential for the auth handshake. Token wins over login.
    pub fn credential(&self) -> Option<Credential> {
        match (&self.token, &self.login) {
            (Some(token), _) => Some(Credential::Token(token.clone())),
            (None, Some(login)) => Some(Credential::Login(login.clone())),
            (None, None) => None,
        }
    }

    /// Client session settings.
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            transport: self.transport_kind,
            url: self.url.clone(),
            reconnect: self.reconnect,
            reconnect_min_interval: Duration::from_millis(self.reconnect_min_interval_ms),
            reconnect_max_interval: Duration::from_millis(self.reconnect_max_interval_ms),
            backoff_factor: self.backoff_factor,
            credential: self.credential(),
        }
    }

    /// Client throttle settings.
    pub fn throttle_options(&self) -> ThrottleOptions {
        ThrottleOptions {
            rate_limit: Duration::from_millis(self.rate_limit_ms),
            dedup_window: Duration::from_millis(self.dedup_window_ms),
        }
    }

    /// Server settings.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            bind: self.bind.clone(),
            resend_interval: Duration::from_millis(self.resend_interval_ms),
        }
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(e) => log::warn!("Ignoring {}={:?}: {}", key, raw, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.transport_kind, TransportPreference::Auto);
        assert!(config.url.is_none());
        assert!(config.reconnect);
        assert_eq!(config.reconnect_min_interval_ms, 1000);
        assert_eq!(config.reconnect_max_interval_ms, 30_000);
        assert!((config.backoff_factor - 1.8).abs() < f64::EPSILON);
        assert_eq!(config.rate_limit_ms, 400);
        assert_eq!(config.dedup_window_ms, 5000);
        assert_eq!(config.resend_interval_ms, 5000);
        assert_eq!(config.bind, "127.0.0.1:3000");
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"transportKind":"polling","url":"https://x/poll"}"#).unwrap();
        assert_eq!(config.transport_kind, TransportPreference::Polling);
        assert_eq!(config.url.as_deref(), Some("https://x/poll"));
        assert_eq!(config.rate_limit_ms, 400);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(Config::load_from(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ nope").unwrap();
        assert!(Config::load_from(dir.path()).is_err());
    }

    #[test]
    fn test_save_and_reload_skips_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            url: Some("wss://notify.example.com".into()),
            login: Some("alice".into()),
            token: Some("secret".into()),
            ..Config::default()
        };
        config.save_to(dir.path()).unwrap();

        let raw = fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(!raw.contains("secret"));

        let loaded = Config::load_from(dir.path()).unwrap();
        assert_eq!(loaded.url, config.url);
        assert_eq!(loaded.login.as_deref(), Some("alice"));
        assert!(loaded.token.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        Config::default().save_to(dir.path()).unwrap();
        let mode = fs::metadata(dir.path().join(CONFIG_FILE))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("QUACK_URL", "ws://localhost:3000"),
            ("QUACK_TRANSPORT", "sse"),
            ("QUACK_RECONNECT", "false"),
            ("QUACK_RECONNECT_MIN_MS", "250"),
            ("QUACK_BACKOFF_FACTOR", "2.5"),
            ("QUACK_RESEND_INTERVAL_MS", "100"),
            ("QUACK_TOKEN", "t0k"),
        ]));

        assert_eq!(config.url.as_deref(), Some("ws://localhost:3000"));
        assert_eq!(config.transport_kind, TransportPreference::Events);
        assert!(!config.reconnect);
        assert_eq!(config.reconnect_min_interval_ms, 250);
        assert!((config.backoff_factor - 2.5).abs() < f64::EPSILON);
        assert_eq!(config.server_options().resend_interval, Duration::from_millis(100));
        assert_eq!(config.credential(), Some(Credential::Token("t0k".into())));
    }

    #[test]
    fn test_unparseable_override_is_skipped() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("QUACK_RATE_LIMIT_MS", "fast"),
            ("QUACK_TRANSPORT", "carrier-pigeon"),
        ]));
        assert_eq!(config.rate_limit_ms, 400);
        assert_eq!(config.transport_kind, TransportPreference::Auto);
    }

    #[test]
    fn test_session_options_mapping() {
        let config = Config {
            url: Some("https://x".into()),
            login: Some("bob".into()),
            reconnect_max_interval_ms: 9000,
            ..Config::default()
        };
        let options = config.session_options();
        assert_eq!(options.url.as_deref(), Some("https://x"));
        assert_eq!(options.reconnect_max_interval, Duration::from_millis(9000));
        assert_eq!(options.credential, Some(Credential::Login("bob".into())));
        assert_eq!(config.throttle_options(), ThrottleOptions::default());
    }
}
