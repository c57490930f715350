use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "TERMHOST_CONFIG";

/// Environment variable that overrides `server.port`.
pub const PORT_ENV: &str = "PORT";

/// Top-level configuration loaded from `termhost.toml`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub terminal: TerminalConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `$TERMHOST_CONFIG` or `./termhost.toml`, falling back
    /// to defaults when the file does not exist. `$PORT` is applied last.
    ///
    /// Runs before logging is set up, so where the settings came from is
    /// returned for the caller to log.
    pub fn load() -> Result<(Self, ConfigSource), ConfigError> {
        let (mut cfg, source) = Self::load_or_default(Self::default_path())?;
        cfg.apply_port_override(std::env::var(PORT_ENV).ok().as_deref())?;
        cfg.validate()?;
        Ok((cfg, source))
    }

    /// Load from `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<(Self, ConfigSource), ConfigError> {
        let path = path.into();
        if path.exists() {
            let cfg = Self::load_from(&path)?;
            Ok((cfg, ConfigSource::File(path)))
        } else {
            Ok((Config::default(), ConfigSource::Defaults(path)))
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Override the listen port with the value of `$PORT`, if one was given.
    /// Blank values are ignored.
    pub fn apply_port_override(&mut self, value: Option<&str>) -> Result<(), ConfigError> {
        let Some(raw) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(());
        };
        self.server.port = raw
            .parse()
            .map_err(|_| ConfigError::Validation(format!("{PORT_ENV}={raw:?} is not a valid port")))?;
        Ok(())
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.terminal.validate()
    }

    fn default_path() -> PathBuf {
        std::env::var_os(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("termhost.toml"))
    }
}

/// Where [`Config::load`] found its settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    /// Nothing at this path; built-in defaults were used.
    Defaults(PathBuf),
}

impl ConfigSource {
    pub fn log(&self) {
        match self {
            Self::File(path) => tracing::info!(path = %path.display(), "loaded config file"),
            Self::Defaults(path) => {
                tracing::info!(path = %path.display(), "no config file found, using defaults")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl ServerConfig {
    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".into()
}
fn default_server_port() -> u16 {
    8080
}

/// Which child programs may be launched and how many may run at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalConfig {
    #[serde(default = "default_apps_directory")]
    pub apps_directory: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
    /// Invocable name -> description. Keys form the whitelist.
    #[serde(default = "default_allowed_apps")]
    pub allowed_apps: BTreeMap<String, String>,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            apps_directory: default_apps_directory(),
            max_concurrent: default_max_concurrent(),
            allowed_origins: default_allowed_origins(),
            allowed_apps: default_allowed_apps(),
        }
    }
}

impl TerminalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "terminal.max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.apps_directory.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "terminal.apps_directory must not be empty".to_string(),
            ));
        }
        for name in self.allowed_apps.keys() {
            if !is_plain_app_name(name) {
                return Err(ConfigError::Validation(format!(
                    "terminal.allowed_apps entry {name:?} must be a plain file name"
                )));
            }
        }
        Ok(())
    }
}

/// App names are joined onto `apps_directory`, so they must not be able to
/// escape it.
fn is_plain_app_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.chars().any(char::is_whitespace)
}

fn default_apps_directory() -> PathBuf {
    PathBuf::from("./terminal-apps")
}
fn default_max_concurrent() -> usize {
    1
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:5173".into()]
}
fn default_allowed_apps() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "tradingcardsearch".to_string(),
            "Search for trading cards".to_string(),
        ),
        (
            "testapp".to_string(),
            "App to test if terminal is working when running an app".to_string(),
        ),
    ])
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_app_names() {
        assert!(is_plain_app_name("testapp"));
        assert!(is_plain_app_name("kanban-v2"));
        assert!(!is_plain_app_name(""));
        assert!(!is_plain_app_name(".."));
        assert!(!is_plain_app_name("../bin/sh"));
        assert!(!is_plain_app_name("a b"));
    }

    #[test]
    fn port_override_ignores_blank() {
        let mut cfg = Config::default();
        cfg.apply_port_override(Some("  ")).unwrap();
        assert_eq!(cfg.server.port, 8080);
        cfg.apply_port_override(None).unwrap();
        assert_eq!(cfg.server.port, 8080);
    }
}
