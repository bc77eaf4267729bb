//! Engine configuration loaded from environment variables.

use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{EngineError, Result};

#[derive(Debug)]
pub struct Config {
    /// Path to the SQLite database holding engine records
    pub database_url: String,
    /// Port for the read-only status API
    pub api_port: u16,
    /// Webhook receiving notifications as JSON; notifications are only logged when unset
    pub notify_webhook_url: Option<String>,
    pub settings: EngineSettings,
}

/// Knobs the engine itself reads. Split from [`Config`] so tests can build it directly.
#[derive(Debug)]
pub struct EngineSettings {
    /// Platform account that receives investments and co-signs the escrow
    pub platform_pubkey: String,
    pub platform_seed: SecretString,
    /// Asset code of the stablecoin used for every cash movement
    pub stablecoin_code: String,
    pub stablecoin_issuer: String,
    /// How long the unlock-wait task waits for the recipient
    pub lock_timeout: Duration,
    /// How often the unlock-wait task re-reads the project
    pub unlock_poll_interval: Duration,
    /// Cadence of payment reminders to funded recipients
    pub reminder_interval: Duration,
    /// Fixed return rate used when a project does not set its own
    pub default_interest_rate: f64,
    /// Price per kWh used by the bill estimate
    pub energy_price: f64,
    /// kWh assumed when a recipient's teller has not reported
    pub average_consumption_kwh: f64,
    /// Reports needed before an admin may flag a project
    pub report_threshold: u32,
}

impl EngineSettings {
    pub fn new(platform_pubkey: impl Into<String>, platform_seed: SecretString) -> Self {
        let platform_pubkey = platform_pubkey.into();
        Self {
            stablecoin_issuer: platform_pubkey.clone(),
            platform_pubkey,
            platform_seed,
            stablecoin_code: "STABLEUSD".to_string(),
            lock_timeout: Duration::from_secs(3 * 24 * 60 * 60),
            unlock_poll_interval: Duration::from_secs(10),
            reminder_interval: Duration::from_secs(2 * 7 * 24 * 60 * 60),
            default_interest_rate: 0.05,
            energy_price: 0.2,
            average_consumption_kwh: 600.0,
            report_threshold: 10,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let platform_pubkey = env_var("PLATFORM_PUBKEY").map_err(|_| {
            EngineError::Config("PLATFORM_PUBKEY environment variable is required".to_string())
        })?;
        let platform_seed = env_var("PLATFORM_SEED").map_err(|_| {
            EngineError::Config("PLATFORM_SEED environment variable is required".to_string())
        })?;

        let mut settings = EngineSettings::new(platform_pubkey, SecretString::from(platform_seed));
        if let Ok(code) = env_var("STABLECOIN_CODE") {
            settings.stablecoin_code = code;
        }
        if let Ok(issuer) = env_var("STABLECOIN_ISSUER") {
            settings.stablecoin_issuer = issuer;
        }
        settings.lock_timeout = Duration::from_secs(parse_or("LOCK_TIMEOUT_SECS", 259_200)?);
        settings.unlock_poll_interval = Duration::from_secs(parse_or("UNLOCK_POLL_SECS", 10)?);
        settings.reminder_interval =
            Duration::from_secs(parse_or("REMINDER_INTERVAL_SECS", 1_209_600)?);
        settings.default_interest_rate = parse_or("DEFAULT_INTEREST_RATE", 0.05)?;
        settings.energy_price = parse_or("ENERGY_PRICE", 0.2)?;
        settings.average_consumption_kwh = parse_or("AVERAGE_CONSUMPTION_KWH", 600.0)?;
        settings.report_threshold = parse_or("REPORT_THRESHOLD", 10)?;

        Ok(Config {
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./settlement.db".to_string()),
            api_port: parse_or("API_PORT", 3002)?,
            notify_webhook_url: env_var("NOTIFY_WEBHOOK_URL").ok(),
            settings,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| EngineError::Config(format!("Missing env var: {key}")))
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T> {
    match env_var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("Invalid {key}"))),
        Err(_) => Ok(default),
    }
}
