use chrono_tz::Tz;
use rocket::figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_API_BASE_PATH: &str = "/api";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub api: ApiConfig,
    pub cors: CorsConfig,
    pub telegram: TelegramConfig,
    pub operators: OperatorsConfig,
    pub schedule: ScheduleConfig,
    pub scanner: ScannerConfig,
    pub flow: FlowConfig,
    pub cron: CronConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: u64,
    pub run_migrations: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub address: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json_format: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    pub base_path: String,
    pub enable_swagger: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
    pub allow_credentials: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub bot_token: String,
    pub api_base_url: String,
    pub request_timeout_seconds: u64,
}

/// Actor ids allowed to run the session creation and editing flows.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OperatorsConfig {
    pub ids: Vec<i64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScheduleConfig {
    /// IANA zone used to read operator input and to render timestamps.
    pub timezone: String,
    pub default_duration_minutes: i32,
    pub manage_lookback_minutes: i64,
    pub manage_horizon_days: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScannerConfig {
    pub enabled: bool,
    pub interval_seconds: u64,
    pub startup_delay_seconds: u64,
    pub lead_seconds: i64,
    pub tolerance_seconds: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct FlowConfig {
    /// Contexts idle for longer than this are dropped. Zero keeps them forever.
    pub ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct CronConfig {
    pub auth_token: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/class_pulse".to_string(),
            max_connections: 16,
            min_connections: 2,
            acquire_timeout: 5,
            run_migrations: true,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            address: "127.0.0.1".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_API_BASE_PATH.to_string(),
            enable_swagger: true,
        }
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: Vec::new(),
            allow_credentials: false,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: String::new(),
            api_base_url: "https://api.telegram.org".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: "UTC".to_string(),
            default_duration_minutes: 90,
            manage_lookback_minutes: 60,
            manage_horizon_days: 60,
        }
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 30,
            startup_delay_seconds: 5,
            lead_seconds: 300,
            tolerance_seconds: 15,
        }
    }
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: 3600,
            sweep_interval_seconds: 300,
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<Tz, String> {
        self.timezone.parse::<Tz>().map_err(|err| format!("Unknown timezone '{}': {}", self.timezone, err))
    }
}

impl ScannerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_seconds)
    }
}

impl FlowConfig {
    pub fn ttl(&self) -> Option<Duration> {
        (self.ttl_seconds > 0).then(|| Duration::from_secs(self.ttl_seconds))
    }
}

impl Config {
    /// Load configuration from multiple sources in priority order:
    /// 1. Built-in defaults
    /// 2. ClassPulse.toml (optional)
    /// 3. Environment variables prefixed with CLASS_PULSE_, `__` separating sections
    ///    (e.g. CLASS_PULSE_TELEGRAM__BOT_TOKEN)
    /// 4. DATABASE_URL and TELEGRAM_BOT_TOKEN as plain variables
    pub fn load() -> Result<Self, figment::Error> {
        let defaults = toml::to_string(&Config::default()).map_err(|err| figment::Error::from(err.to_string()))?;

        Figment::new()
            .merge(Toml::string(&defaults))
            .merge(Toml::file("ClassPulse.toml"))
            .merge(Env::prefixed("CLASS_PULSE_").split("__"))
            .merge(Env::raw().only(&["DATABASE_URL"]).map(|_| "database.url".into()))
            .merge(Env::raw().only(&["TELEGRAM_BOT_TOKEN"]).map(|_| "telegram.bot_token".into()))
            .extract()
    }
}
