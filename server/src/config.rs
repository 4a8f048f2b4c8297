use anyhow::{anyhow, bail, Error, Result};
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::Deserialize;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::string::ToString;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/accounts/config.toml";
const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 10;
const MAX_SHUTDOWN_TIMEOUT_SECS: u64 = 60 * 60;
const MAX_MONITOR_INTERVAL_SECS: u64 = 24 * 60 * 60;

#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    pub log: Option<String>,
    #[serde(default)]
    pub server: Server,
    pub postgres: Option<Postgres>,
    pub auth: Auth,
    #[serde(default)]
    pub shutdown: Shutdown,
    #[serde(default)]
    pub monitor: Monitor,
}

#[derive(Deserialize, Clone, Debug)]
pub struct Server {
    #[serde(default = "addr_default")]
    pub addr: String,
    /// per request timeout in seconds
    #[serde(default = "request_timeout_default")]
    pub timeout: u64,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: addr_default(),
            timeout: request_timeout_default(),
        }
    }
}

fn addr_default() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}

fn request_timeout_default() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

#[derive(Deserialize, Clone, Debug)]
pub struct Postgres {
    pub url: String,
    #[serde(default)]
    pub migrate: bool,
}

#[derive(Deserialize, Clone)]
pub struct Auth {
    pub secret: String,
    /// token lifetime in seconds
    #[serde(default = "ttl_default")]
    pub ttl: u64,
}

// keep the secret out of logs
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

fn ttl_default() -> u64 {
    DEFAULT_TOKEN_TTL_SECS
}

#[derive(Deserialize, Clone, Debug)]
pub struct Shutdown {
    #[serde(default = "shutdown_timeout_default")]
    pub timeout: u64,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self {
            timeout: shutdown_timeout_default(),
        }
    }
}

fn shutdown_timeout_default() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

#[derive(Deserialize, Clone, Debug)]
pub struct Monitor {
    #[serde(default = "monitor_interval_default")]
    pub interval: u64,
}

impl Default for Monitor {
    fn default() -> Self {
        Self {
            interval: monitor_interval_default(),
        }
    }
}

fn monitor_interval_default() -> u64 {
    DEFAULT_MONITOR_INTERVAL_SECS
}

impl Config {
    pub fn load(path: Option<PathBuf>) -> Result<Self, Error> {
        let path = path.unwrap_or(PathBuf::from(DEFAULT_CONFIG_PATH));
        let figment = Figment::new();
        let figment = match path.extension().and_then(OsStr::to_str) {
            Some("toml") => figment.merge(Toml::file(path)),
            Some("yaml") | Some("yml") => figment.merge(Yaml::file(path)),
            Some(ext) => return Err(anyhow!("unexpected file extension '{}'", ext)),
            None => return Err(anyhow!("failed to parse path")),
        };

        // environment wins over the file
        let config: Config = figment
            .merge(Env::prefixed("ACCOUNTS_").split("_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.auth.secret.trim().is_empty() {
            bail!("auth.secret must not be empty");
        }
        if self.monitor.interval == 0 {
            bail!("monitor.interval must be greater than zero");
        }
        if self.monitor.interval > MAX_MONITOR_INTERVAL_SECS {
            bail!(
                "monitor.interval must be at most {} seconds",
                MAX_MONITOR_INTERVAL_SECS
            );
        }
        if self.shutdown.timeout > MAX_SHUTDOWN_TIMEOUT_SECS {
            bail!(
                "shutdown.timeout must be at most {} seconds",
                MAX_SHUTDOWN_TIMEOUT_SECS
            );
        }
        if self.auth.ttl == 0 {
            bail!("auth.ttl must be greater than zero");
        }
        Ok(())
    }

    pub fn log_level(&self) -> LevelFilter {
        match self
            .log
            .to_owned()
            .unwrap_or_else(|| "INFO".to_string())
            .to_uppercase()
            .as_str()
        {
            "TRACE" => LevelFilter::TRACE,
            "DEBUG" => LevelFilter::DEBUG,
            "WARN" => LevelFilter::WARN,
            "ERROR" => LevelFilter::ERROR,
            "INFO" => LevelFilter::INFO,
            _ => LevelFilter::INFO,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.auth.ttl)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.timeout)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval)
    }
}
