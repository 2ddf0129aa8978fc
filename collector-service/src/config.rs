use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub uri: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    pub base_url: String,
    pub token: String,
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingConfig {
    /// Fixed cost per energy unit.
    #[serde(default = "default_tariff")]
    pub tariff: f64,
    /// How often the recurring billing job runs.
    #[serde(default = "default_billing_interval_minutes")]
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_window_minutes")]
    pub window_minutes: i64,
    #[serde(default = "default_min_points")]
    pub min_points: usize,
    /// Max rounded spread (in whole power units) still considered flat.
    #[serde(default = "default_eps")]
    pub eps: i64,
    #[serde(default = "default_health_interval_minutes")]
    pub interval_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    #[serde(default)]
    pub use_tls: bool,
    pub from_address: String,
    pub alert_recipient: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    pub email: Option<EmailConfig>,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("COLLECTOR_CONFIG").unwrap_or_else(|_| "collector-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&contents)?;
        Ok(cfg)
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            tariff: default_tariff(),
            interval_minutes: default_billing_interval_minutes(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window_minutes: default_window_minutes(),
            min_points: default_min_points(),
            eps: default_eps(),
            interval_minutes: default_health_interval_minutes(),
        }
    }
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_tariff() -> f64 {
    8.0
}

fn default_billing_interval_minutes() -> u64 {
    60
}

fn default_window_minutes() -> i64 {
    60
}

fn default_min_points() -> usize {
    10
}

fn default_eps() -> i64 {
    1
}

fn default_health_interval_minutes() -> u64 {
    720
}
