//! Server configuration parsing, environment overrides and validation.

use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::app::builtin;
use crate::{AppError, Result};

/// Environment variable carrying the public listening port.
pub const PORT_ENV: &str = "PORT";

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> u32 {
    2
}

fn default_timeout_seconds() -> u64 {
    300
}

fn default_graceful_timeout_seconds() -> u64 {
    30
}

fn default_boot_timeout_seconds() -> u64 {
    30
}

fn default_monitor_interval_ms() -> u64 {
    1000
}

fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_app() -> String {
    builtin::DEFAULT_APP.into()
}

/// Process-wide server configuration.
///
/// Built once at startup from defaults, an optional TOML file, the `PORT`
/// environment variable and CLI flags (in that order of precedence), then
/// shared read-only with the supervisor.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface the public socket binds to.
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Public listening port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of worker processes kept alive.
    #[serde(default = "default_workers")]
    pub workers: u32,
    /// Maximum time a single request may keep a worker busy.
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Time granted to in-flight requests during shutdown.
    #[serde(default = "default_graceful_timeout_seconds")]
    pub graceful_timeout_seconds: u64,
    /// Time a freshly spawned worker has to report `ready`.
    #[serde(default = "default_boot_timeout_seconds")]
    pub boot_timeout_seconds: u64,
    /// Period of the supervisor's health check cycle.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Largest request body a worker reads before answering `413`.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Name of the built-in app served by every worker.
    #[serde(default = "default_app")]
    pub app: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            timeout_seconds: default_timeout_seconds(),
            graceful_timeout_seconds: default_graceful_timeout_seconds(),
            boot_timeout_seconds: default_boot_timeout_seconds(),
            monitor_interval_ms: default_monitor_interval_ms(),
            max_body_bytes: default_max_body_bytes(),
            app: default_app(),
        }
    }
}

impl ServerConfig {
    /// Build the configuration from an optional TOML file plus the `PORT`
    /// environment variable, then validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, `PORT` is not a valid port, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the port from the `PORT` environment variable when set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `PORT` is set but is not a valid port.
    pub fn apply_env(&mut self) -> Result<()> {
        match env::var(PORT_ENV) {
            Ok(raw) if raw.trim().is_empty() => Ok(()),
            Ok(raw) => {
                self.port = raw.trim().parse().map_err(|err| {
                    AppError::Config(format!("{PORT_ENV}={raw:?} is not a valid port: {err}"))
                })?;
                Ok(())
            }
            Err(env::VarError::NotPresent) => Ok(()),
            Err(err) => Err(AppError::Config(format!("{PORT_ENV} unreadable: {err}"))),
        }
    }

    /// Check invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(AppError::Config("workers must be greater than zero".into()));
        }
        if self.timeout_seconds == 0 {
            return Err(AppError::Config(
                "timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.boot_timeout_seconds == 0 {
            return Err(AppError::Config(
                "boot_timeout_seconds must be greater than zero".into(),
            ));
        }
        if self.monitor_interval_ms == 0 {
            return Err(AppError::Config(
                "monitor_interval_ms must be greater than zero".into(),
            ));
        }
        if builtin::resolve(&self.app).is_none() {
            return Err(AppError::Config(format!(
                "unknown app {:?} (available: {})",
                self.app,
                builtin::NAMES.join(", ")
            )));
        }
        Ok(())
    }

    /// Public socket address the supervisor binds.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Replace host and port with the components of `addr`.
    pub fn set_bind_addr(&mut self, addr: SocketAddr) {
        self.host = addr.ip();
        self.port = addr.port();
    }

    /// Number of worker slots in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        usize::try_from(self.workers).unwrap_or(usize::MAX)
    }

    /// Per-request timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Shutdown grace period.
    #[must_use]
    pub fn graceful_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_timeout_seconds)
    }

    /// Worker boot timeout.
    #[must_use]
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_seconds)
    }

    /// Supervisor health check period.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }
}
