//! Process configuration.
//!
//! Layers, lowest first: an optional TOML file, environment variables
//! (including any loaded from `.env`), then command-line flags.

use std::path::Path;
use std::time::Duration;

use databricks::{ClientError, Credentials};
use mcp::TransportKind;
use serde::Deserialize;

pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8000;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Contents of a `--config` file. Every field is optional.
///
/// ```toml
/// [databricks]
/// host = "adb-123.azuredatabricks.net"
///
/// [server]
/// transport = "streamable-http"
/// port = 8080
/// shutdown_grace_secs = 5
/// session_idle_secs = 900
///
/// [logging]
/// level = "databricks=debug,info"
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub databricks: DatabricksSection,
    pub server: ServerSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabricksSection {
    pub host: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub transport: Option<TransportKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub request_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub session_idle_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub debug: Option<bool>,
}

impl FileConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::parse(&content)
    }

    pub fn parse(toml: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Values given on the command line. `None` leaves the lower layers alone.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub transport: Option<TransportKind>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub transport: TransportKind,
    pub server_host: String,
    pub server_port: u16,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Idle limit for streamable-HTTP sessions.
    pub session_idle: Duration,
    /// `EnvFilter` directives.
    pub log_filter: String,
}

impl Config {
    /// Resolve from the process environment.
    pub fn from_env(file: FileConfig, overrides: Overrides) -> Result<Self, ConfigError> {
        Self::from_lookup(file, overrides, |name| std::env::var(name).ok())
    }

    /// Resolve using `lookup` in place of the environment.
    pub fn from_lookup(
        file: FileConfig,
        overrides: Overrides,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let host = var("DATABRICKS_HOST")
            .or(file.databricks.host)
            .ok_or(ConfigError::Missing("DATABRICKS_HOST"))?;
        let token = var("DATABRICKS_TOKEN")
            .or(file.databricks.token)
            .ok_or(ConfigError::Missing("DATABRICKS_TOKEN"))?;
        let credentials = Credentials::new(host, token)?;

        let transport = match overrides.transport {
            Some(kind) => kind,
            None => match var("TRANSPORT") {
                Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                    name: "TRANSPORT",
                    value: raw,
                    reason: "expected stdio, sse or streamable-http".to_string(),
                })?,
                None => file.server.transport.unwrap_or_default(),
            },
        };

        let server_host = overrides
            .host
            .or_else(|| var("SERVER_HOST"))
            .or(file.server.host)
            .unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string());

        let server_port = match overrides.port {
            Some(port) => port,
            None => parse_var(&var, "SERVER_PORT")?
                .or(file.server.port)
                .unwrap_or(DEFAULT_SERVER_PORT),
        };

        let request_timeout = parse_var::<u64>(&var, "REQUEST_TIMEOUT_SECS")?
            .or(file.server.request_timeout_secs)
            .map_or(runtime::DEFAULT_TIMEOUT, Duration::from_secs);
        let shutdown_grace = parse_var::<u64>(&var, "SHUTDOWN_GRACE_SECS")?
            .or(file.server.shutdown_grace_secs)
            .map_or(DEFAULT_SHUTDOWN_GRACE, Duration::from_secs);
        let session_idle = parse_var::<u64>(&var, "SESSION_IDLE_SECS")?
            .or(file.server.session_idle_secs)
            .map_or(mcp::DEFAULT_SESSION_IDLE, Duration::from_secs);
        if session_idle.is_zero() {
            return Err(ConfigError::Invalid {
                name: "SESSION_IDLE_SECS",
                value: "0".to_string(),
                reason: "must be at least one second".to_string(),
            });
        }

        let debug = match var("DEBUG") {
            Some(raw) => is_truthy(&raw),
            None => file.logging.debug.unwrap_or(false),
        };
        let log_filter = var("LOG_LEVEL")
            .or(file.logging.level)
            .map(|level| level.to_ascii_lowercase())
            .unwrap_or_else(|| (if debug { "debug" } else { "info" }).to_string());

        Ok(Self {
            credentials,
            transport,
            server_host,
            server_port,
            request_timeout,
            shutdown_grace,
            session_idle,
            log_filter,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    var: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    let Some(raw) = var(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<T>() {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(ConfigError::Invalid {
            name,
            reason: e.to_string(),
            value: raw,
        }),
    }
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid {name} {value:?}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Credentials(#[from] ClientError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    const CREDS: &[(&str, &str)] = &[
        ("DATABRICKS_HOST", "adb-1.azuredatabricks.net"),
        ("DATABRICKS_TOKEN", "dapi-secret"),
    ];

    #[test]
    fn defaults() {
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), env(CREDS)).unwrap();
        assert_eq!(config.credentials.host(), "https://adb-1.azuredatabricks.net");
        assert_eq!(config.transport, TransportKind::Stdio);
        assert_eq!(config.server_host, "0.0.0.0");
        assert_eq!(config.server_port, 8000);
        assert_eq!(config.request_timeout, runtime::DEFAULT_TIMEOUT);
        assert_eq!(config.shutdown_grace, DEFAULT_SHUTDOWN_GRACE);
        assert_eq!(config.session_idle, mcp::DEFAULT_SESSION_IDLE);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn missing_credentials_are_fatal() {
        let err = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABRICKS_HOST")));

        let err = Config::from_lookup(
            FileConfig::default(),
            Overrides::default(),
            env(&[("DATABRICKS_HOST", "h"), ("DATABRICKS_TOKEN", "  ")]),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABRICKS_TOKEN")));
    }

    #[test]
    fn layers_override_in_order() {
        let file = FileConfig::parse(
            r#"
            [server]
            transport = "sse"
            host = "127.0.0.1"
            port = 9000
            shutdown_grace_secs = 3
            session_idle_secs = 120
            "#,
        )
        .unwrap();
        let mut vars = CREDS.to_vec();
        vars.push(("SERVER_PORT", "9100"));
        vars.push(("TRANSPORT", "streamable-http"));

        let overrides = Overrides {
            port: Some(9200),
            ..Default::default()
        };
        let config = Config::from_lookup(file, overrides, env(&vars)).unwrap();
        assert_eq!(config.transport, TransportKind::StreamableHttp);
        assert_eq!(config.server_host, "127.0.0.1");
        assert_eq!(config.server_port, 9200);
        assert_eq!(config.shutdown_grace, Duration::from_secs(3));
        assert_eq!(config.session_idle, Duration::from_secs(120));
    }

    #[test]
    fn session_idle_from_env_must_be_positive() {
        let mut vars = CREDS.to_vec();
        vars.push(("SESSION_IDLE_SECS", "300"));
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap();
        assert_eq!(config.session_idle, Duration::from_secs(300));

        let mut vars = CREDS.to_vec();
        vars.push(("SESSION_IDLE_SECS", "0"));
        let err = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SESSION_IDLE_SECS", .. }));
    }

    #[test]
    fn debug_flag_and_log_level() {
        let mut vars = CREDS.to_vec();
        vars.push(("DEBUG", "True"));
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap();
        assert_eq!(config.log_filter, "debug");

        vars.push(("LOG_LEVEL", "WARN"));
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap();
        assert_eq!(config.log_filter, "warn");
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let mut vars = CREDS.to_vec();
        vars.push(("REQUEST_TIMEOUT_SECS", "soon"));
        let err = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap_err();
        assert!(err.to_string().contains("REQUEST_TIMEOUT_SECS"));

        let mut vars = CREDS.to_vec();
        vars.push(("TRANSPORT", "websocket"));
        let err = Config::from_lookup(FileConfig::default(), Overrides::default(), env(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "TRANSPORT", .. }));
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let err = FileConfig::parse("[server]\nlisten = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn debug_output_hides_token() {
        let config = Config::from_lookup(FileConfig::default(), Overrides::default(), env(CREDS)).unwrap();
        assert!(!format!("{config:?}").contains("dapi-secret"));
    }
}
