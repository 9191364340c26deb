use std::{env, fmt, net::SocketAddr, str::FromStr, time::Duration};

use super::server_bind_address;

pub const DEFAULT_DATABASE_URL: &str = "sqlite://domain_checker.db?mode=rwc";
pub const DEFAULT_LOOKUP_BASE_URL: &str = "https://check.skiddle.id/";
pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org/";

/// Application runtime environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
    Test,
}

impl Environment {
    fn from_str(value: &str) -> Result<Self, ConfigError> {
        match value {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(ConfigError::InvalidEnvironment(other.to_string())),
        }
    }

    /// Returns the canonical name used for logging/metrics labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

/// Settings for the periodic monitoring sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Wall-clock hour of the daily run.
    pub hour: u32,
    pub minute: u32,
    /// IANA time zone name the daily hour is expressed in.
    pub timezone: String,
    /// Fixed cadence that replaces the daily schedule when set.
    pub interval: Option<Duration>,
    /// Number of subscriptions checked concurrently.
    pub concurrency: usize,
    /// Minimum spacing between outbound status lookups.
    pub spacing: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            hour: 9,
            minute: 0,
            timezone: "UTC".to_string(),
            interval: None,
            concurrency: 1,
            spacing: Duration::from_millis(1000),
        }
    }
}

/// Runtime configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub environment: Environment,
    pub database_url: String,
    pub lookup_base_url: String,
    pub lookup_timeout: Duration,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    /// Upper bound for one Telegram request, and for one change notification.
    pub telegram_timeout: Duration,
    pub subscription_limit: u32,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Constructs the configuration by reading and validating environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env_value = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        let environment = Environment::from_str(&env_value)?;
        let bind_addr = server_bind_address().map_err(ConfigError::BindAddress)?;

        let defaults = MonitorConfig::default();
        let hour = parse_var("MONITOR_HOUR", defaults.hour)?;
        if hour > 23 {
            return Err(ConfigError::OutOfRange {
                name: "MONITOR_HOUR",
                value: hour.to_string(),
            });
        }
        let minute = parse_var("MONITOR_MINUTE", defaults.minute)?;
        if minute > 59 {
            return Err(ConfigError::OutOfRange {
                name: "MONITOR_MINUTE",
                value: minute.to_string(),
            });
        }
        let concurrency = parse_var("MONITOR_CONCURRENCY", defaults.concurrency)?;
        if concurrency == 0 {
            return Err(ConfigError::OutOfRange {
                name: "MONITOR_CONCURRENCY",
                value: concurrency.to_string(),
            });
        }
        let interval = match optional_var("MONITOR_INTERVAL_SECS") {
            Some(raw) => {
                let secs = parse_value::<u64>("MONITOR_INTERVAL_SECS", &raw)?;
                if secs == 0 {
                    return Err(ConfigError::OutOfRange {
                        name: "MONITOR_INTERVAL_SECS",
                        value: raw,
                    });
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };
        let telegram_timeout_secs = parse_var("TELEGRAM_TIMEOUT_SECS", 10u64)?;
        if telegram_timeout_secs == 0 {
            return Err(ConfigError::OutOfRange {
                name: "TELEGRAM_TIMEOUT_SECS",
                value: telegram_timeout_secs.to_string(),
            });
        }
        let spacing_ms = parse_var("MONITOR_SPACING_MS", defaults.spacing.as_millis() as u64)?;

        let monitor = MonitorConfig {
            hour,
            minute,
            timezone: optional_var("MONITOR_TIMEZONE").unwrap_or(defaults.timezone),
            interval,
            concurrency,
            spacing: Duration::from_millis(spacing_ms),
        };

        Ok(Self {
            bind_addr,
            environment,
            database_url: optional_var("DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            lookup_base_url: optional_var("LOOKUP_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LOOKUP_BASE_URL.to_string()),
            lookup_timeout: Duration::from_secs(parse_var("LOOKUP_TIMEOUT_SECS", 15u64)?),
            telegram_bot_token: optional_var("TELEGRAM_BOT_TOKEN"),
            telegram_api_base: optional_var("TELEGRAM_API_BASE")
                .unwrap_or_else(|| DEFAULT_TELEGRAM_API_BASE.to_string()),
            telegram_timeout: Duration::from_secs(telegram_timeout_secs),
            subscription_limit: parse_var("SUBSCRIPTION_LIMIT", 10u32)?,
            monitor,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: raw.to_string(),
    })
}

/// Errors that can occur during configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    InvalidEnvironment(String),
    BindAddress(std::net::AddrParseError),
    InvalidValue { name: &'static str, value: String },
    OutOfRange { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEnvironment(value) => write!(
                f,
                "APP_ENV must be one of 'development', 'production', or 'test' (got {value})"
            ),
            Self::BindAddress(err) => write!(f, "invalid APP_BIND_ADDR value: {err}"),
            Self::InvalidValue { name, value } => write!(f, "invalid {name} value: {value}"),
            Self::OutOfRange { name, value } => write!(f, "{name} is out of range (got {value})"),
        }
    }
}

impl std::error::Error for ConfigError {}
