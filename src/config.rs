use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_GATEWAY_BASE_URL: &str = "http://localhost:9400";
const DEFAULT_INVOICE_PREFIX: &str = "INV";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Sales tax rate applied to taxable lines (e.g., "0.0875" for 8.75%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_tax_rate")]
    pub default_tax_rate: Decimal,

    /// Currency code printed on receipts and sent to the terminal
    #[serde(default = "default_currency")]
    pub default_currency: String,

    /// Prefix for generated invoice numbers
    #[serde(default = "default_invoice_prefix")]
    pub invoice_prefix: String,

    // ========== Payment terminal gateway ==========
    /// Base URL of the terminal gateway API
    #[serde(default = "default_gateway_base_url")]
    pub gateway_base_url: String,

    /// Bearer key sent to the gateway
    #[serde(default)]
    pub gateway_api_key: Option<String>,

    /// Terminal device the gateway should route transactions to
    #[serde(default)]
    pub gateway_device_id: Option<String>,

    /// Per-request timeout for publish calls (seconds)
    #[serde(default = "default_gateway_timeout_secs")]
    pub gateway_timeout_secs: u64,

    /// Hard timeout for status lookups issued by the poller (seconds)
    #[serde(default = "default_gateway_lookup_timeout_secs")]
    pub gateway_lookup_timeout_secs: u64,

    /// Publish retries on transport errors and 5xx responses
    #[serde(default = "default_gateway_publish_max_retries")]
    pub gateway_publish_max_retries: u32,

    /// Base delay for exponential publish backoff (milliseconds)
    #[serde(default = "default_gateway_retry_base_delay_ms")]
    pub gateway_retry_base_delay_ms: u64,

    // ========== Reconciliation ==========
    /// Age after which a pending session is looked up at the gateway on poll.
    /// Must exceed the usual webhook latency.
    #[serde(default = "default_status_poll_stale_after_secs")]
    pub status_poll_stale_after_secs: u64,

    /// Minimum age of a pending session before an operator may force it through
    #[serde(default = "default_force_finalize_min_wait_secs")]
    pub force_finalize_min_wait_secs: u64,

    /// Shared secret for verifying terminal webhook signatures
    #[serde(default)]
    pub terminal_webhook_secret: Option<String>,

    /// Webhook timestamp tolerance (seconds)
    #[serde(default)]
    pub terminal_webhook_tolerance_secs: Option<u64>,

    /// When set, force-finalize requests must carry a matching `x-operator-key`
    #[serde(default)]
    pub operator_override_key: Option<String>,
}

impl AppConfig {
    /// Gets database URL reference
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Creates a new configuration with defaults for everything but the basics
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            default_tax_rate: default_tax_rate(),
            default_currency: default_currency(),
            invoice_prefix: default_invoice_prefix(),
            gateway_base_url: default_gateway_base_url(),
            gateway_api_key: None,
            gateway_device_id: None,
            gateway_timeout_secs: default_gateway_timeout_secs(),
            gateway_lookup_timeout_secs: default_gateway_lookup_timeout_secs(),
            gateway_publish_max_retries: default_gateway_publish_max_retries(),
            gateway_retry_base_delay_ms: default_gateway_retry_base_delay_ms(),
            status_poll_stale_after_secs: default_status_poll_stale_after_secs(),
            force_finalize_min_wait_secs: default_force_finalize_min_wait_secs(),
            terminal_webhook_secret: None,
            terminal_webhook_tolerance_secs: None,
            operator_override_key: None,
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    pub fn tax_rate(&self) -> Decimal {
        self.default_tax_rate
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.status_poll_stale_after_secs as i64)
    }

    pub fn force_min_wait(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.force_finalize_min_wait_secs as i64)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_lookup_timeout_secs)
    }

    pub fn webhook_tolerance_secs(&self) -> i64 {
        self.terminal_webhook_tolerance_secs.unwrap_or(300) as i64
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if self.gateway_lookup_timeout_secs == 0 {
            let mut err = ValidationError::new("gateway_lookup_timeout_secs");
            err.message = Some("gateway_lookup_timeout_secs must be greater than 0".into());
            errors.add("gateway_lookup_timeout_secs", err);
        }

        if self.status_poll_stale_after_secs == 0 {
            let mut err = ValidationError::new("status_poll_stale_after_secs");
            err.message = Some(
                "status_poll_stale_after_secs must be greater than 0 or every poll hits the gateway"
                    .into(),
            );
            errors.add("status_poll_stale_after_secs", err);
        }

        if self.invoice_prefix.trim().is_empty() {
            let mut err = ValidationError::new("invoice_prefix");
            err.message = Some("invoice_prefix must not be blank".into());
            errors.add("invoice_prefix", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Runs derive validation plus cross-field checks
    pub fn validate_all(&self) -> Result<(), ValidationErrors> {
        self.validate()?;
        self.validate_additional_constraints()
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_tax_rate() -> Decimal {
    Decimal::new(875, 4)
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_invoice_prefix() -> String {
    DEFAULT_INVOICE_PREFIX.to_string()
}

fn default_gateway_base_url() -> String {
    DEFAULT_GATEWAY_BASE_URL.to_string()
}

fn default_gateway_timeout_secs() -> u64 {
    10
}

fn default_gateway_lookup_timeout_secs() -> u64 {
    8
}

fn default_gateway_publish_max_retries() -> u32 {
    3
}

fn default_gateway_retry_base_delay_ms() -> u64 {
    250
}

fn default_status_poll_stale_after_secs() -> u64 {
    20
}

fn default_force_finalize_min_wait_secs() -> u64 {
    45
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("default_tax_rate");
        err.message = Some("default_tax_rate must be between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("pos_checkout={},audit={},tower_http=debug", level, level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Docker config (config/docker.toml) if DOCKER env var is set
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    load_config_from(CONFIG_DIR)
}

pub fn load_config_from(config_dir: &str) -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(config_dir).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            config_dir
        );
    }

    let mut builder = Config::builder()
        .set_default("database_url", "sqlite://pos_checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
        .add_source(File::with_name(&format!("{}/{}", config_dir, run_env)).required(false));

    if env::var("DOCKER").is_ok() {
        info!("Docker environment detected");
        builder =
            builder.add_source(File::with_name(&format!("{}/docker", config_dir)).required(false));
    }

    let config = builder
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration cross-field validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
