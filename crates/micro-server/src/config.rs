//! Settings file for the `micro-server` binary.

use crate::docs::DocsOptions;
use crate::options::{DEFAULT_PRE_SHUTDOWN_DELAY, DEFAULT_SHUTDOWN_TIMEOUT};
use crate::signals::{DEFAULT_SIGNALS, ShutdownSignal};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Failure to load a settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),
}

/// Settings of one service process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub shutdown: ShutdownSettings,

    #[serde(default)]
    pub http: HttpSettings,

    #[serde(default)]
    pub docs: DocsOptions,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Validate for Settings {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.server.validate()?;
        self.shutdown.validate()?;
        validate_docs(&self.docs).map_err(|e| {
            let mut errors = validator::ValidationErrors::new();
            errors.add("docs", e);
            errors
        })?;
        Ok(())
    }
}

/// Listener settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_ports"))]
#[serde(default)]
pub struct ServerSettings {
    pub http_port: u16,
    pub rpc_port: u16,
    pub bind_address: IpAddr,
}

/// Graceful shutdown settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ShutdownSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_shutdown_timeout")]
    pub timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_pre_shutdown_delay")]
    pub pre_shutdown_delay: Duration,

    pub signals: Vec<ShutdownSignal>,
}

/// HTTP gateway settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Static fallback directory, defaults to the working directory.
    pub static_dir: Option<PathBuf>,
    pub metrics_route: bool,
}

/// Subscriber settings for the binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: LogFormat,
}

/// Tracer provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub enabled: bool,
    pub service_name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            http_port: 8888,
            rpc_port: 9999,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

impl Default for ShutdownSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            pre_shutdown_delay: DEFAULT_PRE_SHUTDOWN_DELAY,
            signals: DEFAULT_SIGNALS.to_vec(),
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            static_dir: None,
            metrics_route: true,
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "micro-server".to_string(),
        }
    }
}

fn validate_ports(server: &ServerSettings) -> Result<(), ValidationError> {
    if server.http_port != 0 && server.http_port == server.rpc_port {
        return Err(ValidationError::new("http_and_rpc_port_collide"));
    }
    Ok(())
}

fn validate_shutdown_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    let millis = timeout.as_millis();
    if millis < 1 || millis > 600_000 {
        return Err(ValidationError::new("shutdown_timeout_out_of_range"));
    }
    Ok(())
}

fn validate_pre_shutdown_delay(delay: &Duration) -> Result<(), ValidationError> {
    if delay.as_secs() > 60 {
        return Err(ValidationError::new("pre_shutdown_delay_out_of_range"));
    }
    Ok(())
}

fn validate_docs(docs: &DocsOptions) -> Result<(), ValidationError> {
    if docs.route.is_empty() {
        return Ok(());
    }
    if !docs.route.starts_with('/')
        || docs.route.contains(|c: char| c == '?' || c == '#' || c.is_whitespace())
    {
        return Err(ValidationError::new("docs_route_invalid_format"));
    }
    Ok(())
}

impl Settings {
    /// Load settings from the default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!(path = %path.display(), "Loading settings");
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No settings file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load settings from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate settings from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// First existing file of the search path.
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/micro/micro-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./micro-server.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.exists() && p.is_file())
    }

    /// `~/.config/micro/micro-server.yaml`
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/micro/micro-server.yaml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.shutdown.timeout, Duration::from_secs(30));
        assert_eq!(settings.shutdown.signals, DEFAULT_SIGNALS.to_vec());
    }

    #[test]
    fn test_valid_yaml_parsing() {
        let yaml = r#"
server:
  http_port: 8080
  rpc_port: 9090
  bind_address: 127.0.0.1

shutdown:
  timeout: 10s
  pre_shutdown_delay: 0s
  signals: [SIGTERM, SIGHUP]

http:
  static_dir: /srv/www
  metrics_route: false

docs:
  enabled: true
  route: /api-docs
  title: Pet Store
  spec_urls:
    PetStore: /petstore.json

logging:
  level: debug
  format: json

telemetry:
  enabled: false
  service_name: pets
"#;

        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.http_port, 8080);
        assert_eq!(settings.server.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.shutdown.timeout, Duration::from_secs(10));
        assert_eq!(settings.shutdown.pre_shutdown_delay, Duration::ZERO);
        assert_eq!(
            settings.shutdown.signals,
            vec![ShutdownSignal::Terminate, ShutdownSignal::Hangup]
        );
        assert_eq!(settings.http.static_dir, Some(PathBuf::from("/srv/www")));
        assert!(!settings.http.metrics_route);
        assert!(settings.docs.enabled);
        assert_eq!(settings.docs.spec_urls["PetStore"], "/petstore.json");
        assert_eq!(settings.logging.format, LogFormat::Json);
        assert!(!settings.telemetry.enabled);
        assert_eq!(settings.telemetry.service_name, "pets");
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let yaml = r#"
server:
  http_port: 8080
"#;

        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.server.rpc_port, 9999);
        assert_eq!(settings.shutdown.pre_shutdown_delay, Duration::from_secs(1));
        assert!(settings.http.metrics_route);
        assert!(!settings.docs.enabled);
        assert!(settings.telemetry.enabled);
        assert_eq!(settings.telemetry.service_name, "micro-server");
    }

    #[test]
    fn test_colliding_ports_are_rejected() {
        let yaml = r#"
server:
  http_port: 8080
  rpc_port: 8080
"#;

        assert!(matches!(
            Settings::from_yaml(yaml),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn test_ephemeral_ports_may_both_be_zero() {
        let yaml = r#"
server:
  http_port: 0
  rpc_port: 0
"#;

        assert!(Settings::from_yaml(yaml).is_ok());
    }

    #[test]
    fn test_invalid_shutdown_timeout() {
        let yaml = r#"
shutdown:
  timeout: 0ms
"#;

        assert!(Settings::from_yaml(yaml).is_err());

        let yaml = r#"
shutdown:
  timeout: 1h  # Invalid: > 10m
"#;

        assert!(Settings::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_docs_route() {
        let yaml = r#"
docs:
  enabled: true
  route: docs
"#;

        assert!(Settings::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_signal_fails_to_parse() {
        let yaml = r#"
shutdown:
  signals: [SIGKILL]
"#;

        assert!(matches!(
            Settings::from_yaml(yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  http_port: 7001\n  rpc_port: 7002").unwrap();

        let settings = Settings::load_from_file(file.path()).unwrap();
        assert_eq!(settings.server.http_port, 7001);
        assert_eq!(settings.server.rpc_port, 7002);
    }

    #[test]
    fn test_load_from_missing_file() {
        assert!(matches!(
            Settings::load_from_file("/nonexistent/micro-server.yaml"),
            Err(ConfigError::IoError(_))
        ));
    }
}
