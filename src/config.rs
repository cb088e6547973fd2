use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

pub const DEFAULT_APP_NAME: &str = ".nrtk";
pub const DEFAULT_API_BASE_URL: &str = "https://newsroomtoolkit.com/nrtk-api/project";
pub const DEFAULT_SYNC_HANDLER: &str = "/.nrtk-sync";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub app_name: String,
    pub api_uuid: String,
    pub api_token: String,
    pub api_base_url: String,
    pub api_timeout_secs: u64,
    pub http_server_enabled: bool,
    pub http_server_port: u16,
    pub http_server_workers: usize,
    pub sync_handler: String,
    pub story_extension: String,
    pub mode_infinity_ms: u64,
    pub mode_fetch_local: bool,
    pub local_path: PathBuf,
    pub mode_force_update: bool,
    pub metrics_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.to_string(),
            api_uuid: String::new(),
            api_token: String::new(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            api_timeout_secs: default_api_timeout_secs(),
            http_server_enabled: false,
            http_server_port: default_http_server_port(),
            http_server_workers: default_http_server_workers(),
            sync_handler: DEFAULT_SYNC_HANDLER.to_string(),
            story_extension: "html".to_string(),
            mode_infinity_ms: 0,
            mode_fetch_local: false,
            local_path: PathBuf::from("local.json"),
            mode_force_update: false,
            metrics_interval_secs: 0,
        }
    }
}

/// Values read from `NRTK_*` environment variables. `None` keeps the
/// value coming from the defaults or the TOML file.
#[derive(Debug, Default)]
pub struct AppConfigOverrides {
    pub app_name: Option<String>,
    pub api_uuid: Option<String>,
    pub api_token: Option<String>,
    pub api_base_url: Option<String>,
    pub api_timeout_secs: Option<u64>,
    pub http_server_enabled: Option<bool>,
    pub http_server_port: Option<u16>,
    pub http_server_workers: Option<usize>,
    pub sync_handler: Option<String>,
    pub story_extension: Option<String>,
    pub mode_infinity_ms: Option<u64>,
    pub mode_fetch_local: Option<bool>,
    pub local_path: Option<PathBuf>,
    pub mode_force_update: Option<bool>,
    pub metrics_interval_secs: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required configuration value {0}")]
    Missing(&'static str),
    #[error("failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse TOML config at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the process behaves once the startup sync cycle has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Serve { port: u16 },
    Poll { interval: Duration },
    Once,
}

/// On-disk locations derived from the application root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub content_dir: PathBuf,
    pub snapshot_dir: PathBuf,
    pub meta_path: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            content_dir: root.join("www"),
            snapshot_dir: root.join("snapshot"),
            meta_path: root.join("meta.json"),
            root,
        }
    }
}

/// Loads `.env` from the working directory when `NRTK_DOT_ENV=1`.
///
/// Variables already present in the environment are left untouched.
pub fn load_dotenv() -> Option<Result<PathBuf, dotenvy::Error>> {
    match std::env::var("NRTK_DOT_ENV") {
        Ok(flag) if flag.trim() == "1" => Some(dotenvy::dotenv()),
        _ => None,
    }
}

/// Builds the configuration from defaults, the optional TOML file named by
/// `NRTK_CONFIG`, and `NRTK_*` environment variables, in that order.
pub fn load() -> Result<AppConfig, ConfigError> {
    let mut cfg = match std::env::var_os("NRTK_CONFIG").filter(|value| !value.is_empty()) {
        Some(path) => load_from(Path::new(&path))?,
        None => AppConfig::default(),
    };
    cfg.apply_overrides(&AppConfigOverrides::from_env()?)?;
    Ok(cfg)
}

/// Parses a TOML file. Validation is deferred until overrides are applied,
/// since credentials usually arrive through the environment.
pub fn load_from(path: &Path) -> Result<AppConfig, ConfigError> {
    let path = path.to_path_buf();
    let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::ReadFailed {
        path: path.clone(),
        source,
    })?;

    toml::from_str::<AppConfig>(&raw).map_err(|source| ConfigError::ParseFailed { path, source })
}

impl AppConfigOverrides {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str| lookup(key);
        let flag = |key: &'static str| lookup(key).map(|raw| parse_bool(key, &raw)).transpose();

        Ok(Self {
            app_name: text("NRTK_APP_NAME"),
            api_uuid: text("NRTK_API_UUID"),
            api_token: text("NRTK_API_TOKEN"),
            api_base_url: text("NRTK_API_BASE_URL"),
            api_timeout_secs: parse_opt(&lookup, "NRTK_API_TIMEOUT_SECS")?,
            http_server_enabled: flag("NRTK_HTTP_SERVER_ENABLED")?,
            http_server_port: parse_opt(&lookup, "NRTK_HTTP_SERVER_PORT")?,
            http_server_workers: parse_opt(&lookup, "NRTK_HTTP_SERVER_WORKERS")?,
            sync_handler: text("NRTK_HTTP_SERVER_SYNC_HANDLER"),
            story_extension: text("NRTK_STORY_EXTENSION"),
            mode_infinity_ms: parse_opt(&lookup, "NRTK_MODE_INFINITY")?,
            mode_fetch_local: flag("NRTK_MODE_FETCH_LOCAL")?,
            local_path: text("NRTK_LOCAL_PATH").map(PathBuf::from),
            mode_force_update: flag("NRTK_MODE_FORCE_UPDATE")?,
            metrics_interval_secs: parse_opt(&lookup, "NRTK_METRICS_INTERVAL_SECS")?,
        })
    }
}

impl AppConfig {
    pub fn apply_overrides(&mut self, overrides: &AppConfigOverrides) -> Result<(), ConfigError> {
        if let Some(value) = &overrides.app_name {
            self.app_name = value.clone();
        }
        if let Some(value) = &overrides.api_uuid {
            self.api_uuid = value.clone();
        }
        if let Some(value) = &overrides.api_token {
            self.api_token = value.clone();
        }
        if let Some(value) = &overrides.api_base_url {
            self.api_base_url = value.clone();
        }
        if let Some(value) = overrides.api_timeout_secs {
            self.api_timeout_secs = value;
        }
        if let Some(value) = overrides.http_server_enabled {
            self.http_server_enabled = value;
        }
        if let Some(value) = overrides.http_server_port {
            self.http_server_port = value;
        }
        if let Some(value) = overrides.http_server_workers {
            self.http_server_workers = value;
        }
        if let Some(value) = &overrides.sync_handler {
            self.sync_handler = value.clone();
        }
        if let Some(value) = &overrides.story_extension {
            self.story_extension = value.clone();
        }
        if let Some(value) = overrides.mode_infinity_ms {
            self.mode_infinity_ms = value;
        }
        if let Some(value) = overrides.mode_fetch_local {
            self.mode_fetch_local = value;
        }
        if let Some(value) = &overrides.local_path {
            self.local_path = value.clone();
        }
        if let Some(value) = overrides.mode_force_update {
            self.mode_force_update = value;
        }
        if let Some(value) = overrides.metrics_interval_secs {
            self.metrics_interval_secs = value;
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.app_name.trim().is_empty() {
            return Err(ConfigError::Invalid("app_name must not be empty".into()));
        }
        if !self.sync_handler.starts_with('/') || self.sync_handler.len() < 2 {
            return Err(ConfigError::Invalid(format!(
                "sync_handler must be an absolute path other than '/', got '{}'",
                self.sync_handler
            )));
        }
        if self.api_timeout_secs == 0 {
            return Err(ConfigError::Invalid("api_timeout_secs must be > 0".into()));
        }
        if self.http_server_workers == 0 {
            return Err(ConfigError::Invalid("http_server_workers must be > 0".into()));
        }
        if self.mode_fetch_local {
            if self.local_path.as_os_str().is_empty() {
                return Err(ConfigError::Missing("NRTK_LOCAL_PATH"));
            }
        } else {
            if self.api_uuid.trim().is_empty() {
                return Err(ConfigError::Missing("NRTK_API_UUID"));
            }
            if self.api_token.trim().is_empty() {
                return Err(ConfigError::Missing("NRTK_API_TOKEN"));
            }
            if self.api_base_url.trim().is_empty() {
                return Err(ConfigError::Invalid("api_base_url must not be empty".into()));
            }
        }

        Ok(())
    }

    pub fn layout(&self) -> Layout {
        Layout::new(&self.app_name)
    }

    /// Suffix appended to story files, e.g. `.html`. Empty when no
    /// extension is configured or the configured one is not all lowercase
    /// ASCII letters.
    pub fn story_suffix(&self) -> String {
        let ext = self.story_extension.trim();
        if !ext.is_empty() && story_extension_pattern().is_match(ext) {
            format!(".{ext}")
        } else {
            String::new()
        }
    }

    /// True when an extension was configured but rejected by validation.
    pub fn story_extension_ignored(&self) -> bool {
        !self.story_extension.trim().is_empty() && self.story_suffix().is_empty()
    }

    pub fn remote_url(&self) -> String {
        format!(
            "{}/{}/",
            self.api_base_url.trim().trim_end_matches('/'),
            self.api_uuid.trim()
        )
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn run_mode(&self) -> RunMode {
        if self.http_server_enabled && self.http_server_port > 0 {
            RunMode::Serve {
                port: self.http_server_port,
            }
        } else if self.mode_infinity_ms > 0 {
            RunMode::Poll {
                interval: Duration::from_millis(self.mode_infinity_ms),
            }
        } else {
            RunMode::Once
        }
    }
}

fn story_extension_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[a-z]+$").expect("story extension pattern is valid"))
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "yes" => Ok(true),
        "0" | "f" | "false" | "no" | "" => Ok(false),
        other => Err(ConfigError::Invalid(format!(
            "{key} must be a boolean, got '{other}'"
        ))),
    }
}

fn parse_opt<F, T>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|_| ConfigError::Invalid(format!("{key} must be a number, got '{raw}'")))
        })
        .transpose()
}

const fn default_api_timeout_secs() -> u64 {
    20
}

const fn default_http_server_port() -> u16 {
    8080
}

const fn default_http_server_workers() -> usize {
    8
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn overrides(pairs: &[(&str, &str)]) -> Result<AppConfigOverrides, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfigOverrides::from_lookup(|key| env.get(key).cloned())
    }

    fn remote_config() -> AppConfig {
        AppConfig {
            api_uuid: "project-1".into(),
            api_token: "secret".into(),
            ..AppConfig::default()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.app_name, ".nrtk");
        assert_eq!(cfg.sync_handler, "/.nrtk-sync");
        assert_eq!(cfg.http_server_port, 8080);
        assert_eq!(cfg.api_timeout_secs, 20);
        assert_eq!(cfg.story_suffix(), ".html");
        assert_eq!(cfg.run_mode(), RunMode::Once);
    }

    #[test]
    fn layout_is_rooted_at_app_name() {
        let layout = Layout::new("/srv/site");
        assert_eq!(layout.content_dir, PathBuf::from("/srv/site/www"));
        assert_eq!(layout.snapshot_dir, PathBuf::from("/srv/site/snapshot"));
        assert_eq!(layout.meta_path, PathBuf::from("/srv/site/meta.json"));
    }

    #[test]
    fn story_suffix_accepts_lowercase_letters_only() {
        let mut cfg = AppConfig::default();
        for (ext, expected) in [("htm", ".htm"), ("HTML", ""), ("h1", ""), (".html", ""), ("", "")] {
            cfg.story_extension = ext.into();
            assert_eq!(cfg.story_suffix(), expected, "extension {ext:?}");
        }

        cfg.story_extension = "Html".into();
        assert!(cfg.story_extension_ignored());
        cfg.story_extension = String::new();
        assert!(!cfg.story_extension_ignored());
    }

    #[test]
    fn env_overrides_are_applied_and_validated() {
        let mut cfg = AppConfig::default();
        let env = overrides(&[
            ("NRTK_APP_NAME", "/tmp/site"),
            ("NRTK_API_UUID", "uuid-1"),
            ("NRTK_API_TOKEN", "tok"),
            ("NRTK_HTTP_SERVER_ENABLED", "1"),
            ("NRTK_HTTP_SERVER_PORT", "9090"),
            ("NRTK_STORY_EXTENSION", "htm"),
            ("NRTK_MODE_FORCE_UPDATE", "true"),
            ("NRTK_MODE_INFINITY", "500"),
        ])
        .expect("overrides parse");

        cfg.apply_overrides(&env).expect("overrides validate");

        assert_eq!(cfg.app_name, "/tmp/site");
        assert_eq!(cfg.remote_url(), format!("{DEFAULT_API_BASE_URL}/uuid-1/"));
        assert!(cfg.mode_force_update);
        assert_eq!(cfg.story_suffix(), ".htm");
        assert_eq!(cfg.run_mode(), RunMode::Serve { port: 9090 });
    }

    #[test]
    fn poll_mode_requires_positive_interval_and_no_server() {
        let mut cfg = remote_config();
        cfg.mode_infinity_ms = 1500;
        assert_eq!(
            cfg.run_mode(),
            RunMode::Poll {
                interval: Duration::from_millis(1500)
            }
        );

        cfg.http_server_enabled = true;
        cfg.http_server_port = 0;
        assert!(matches!(cfg.run_mode(), RunMode::Poll { .. }));
    }

    #[test]
    fn rejects_malformed_boolean_and_number() {
        let err = overrides(&[("NRTK_MODE_FETCH_LOCAL", "maybe")]).expect_err("bad bool");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = overrides(&[("NRTK_HTTP_SERVER_PORT", "eighty")]).expect_err("bad port");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn server_needs_at_least_one_worker() {
        let mut cfg = remote_config();
        assert_eq!(cfg.http_server_workers, 8);

        let env = overrides(&[("NRTK_HTTP_SERVER_WORKERS", "0")]).expect("overrides parse");
        let err = cfg.apply_overrides(&env).expect_err("zero workers");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn remote_mode_requires_credentials() {
        let err = AppConfig::default().validate().expect_err("uuid missing");
        assert!(matches!(err, ConfigError::Missing("NRTK_API_UUID")));

        let cfg = AppConfig {
            api_uuid: "p".into(),
            ..AppConfig::default()
        };
        let err = cfg.validate().expect_err("token missing");
        assert!(matches!(err, ConfigError::Missing("NRTK_API_TOKEN")));

        remote_config().validate().expect("complete remote config");
    }

    #[test]
    fn local_mode_does_not_need_credentials() {
        let cfg = AppConfig {
            mode_fetch_local: true,
            ..AppConfig::default()
        };
        cfg.validate().expect("local mode validates");
    }

    #[test]
    fn rejects_relative_sync_handler() {
        let cfg = AppConfig {
            sync_handler: "sync".into(),
            ..remote_config()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn config_example_parses() {
        let raw = include_str!("../config.example.toml");
        let cfg: AppConfig = toml::from_str(raw).expect("example config should parse");
        cfg.validate().expect("example config should validate");
        assert_eq!(cfg.story_suffix(), ".html");
    }

    #[test]
    fn load_from_reports_missing_file() {
        let err = load_from(Path::new("/nonexistent/nrtk/config.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::ReadFailed { .. }));
    }
}
