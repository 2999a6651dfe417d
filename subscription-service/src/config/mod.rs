use secrecy::Secret;
use serde::Deserialize;
use service_core::auth::TokenSettings;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub service_name: String,
    pub store: StoreBackend,
    pub database: DatabaseConfig,
    pub razorpay: RazorpayConfig,
    pub auth: TokenSettings,
    pub billing: BillingSettings,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillingSettings {
    pub currency: String,
    /// Storage every account gets without a plan, in GB.
    pub free_storage_gb: i64,
    /// Pending checkouts older than this are abandoned by the rollover job.
    pub checkout_timeout_minutes: i64,
    /// Days a provider-renewed subscription may stay past expiry while the
    /// renewal charge is on its way.
    pub renewal_grace_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Checkout and verification requests allowed per user per window.
    pub checkout_attempts: u32,
    pub window_seconds: u64,
}

impl SubscriptionConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        let is_prod = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string()) == "prod";

        let store = match get_env("SUBSCRIPTION_STORE", Some("postgres"), false)?.as_str() {
            "memory" if is_prod => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "SUBSCRIPTION_STORE=memory is not allowed in production"
                )));
            }
            "memory" => StoreBackend::Memory,
            "postgres" => StoreBackend::Postgres,
            other => {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Unknown SUBSCRIPTION_STORE '{}'",
                    other
                )));
            }
        };

        let database_default = match store {
            StoreBackend::Memory => Some(""),
            StoreBackend::Postgres => None,
        };

        let hmac_secret = env::var("AUTH_JWT_SECRET").ok().map(Secret::new);
        let public_key_pem = env::var("AUTH_PUBLIC_KEY_PEM").ok();

        Ok(SubscriptionConfig {
            common: common_config,
            service_name: "subscription-service".to_string(),
            store,
            database: DatabaseConfig {
                url: Secret::new(get_env("DATABASE_URL", database_default, is_prod)?),
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 1),
            },
            razorpay: RazorpayConfig {
                key_id: get_env("RAZORPAY_KEY_ID", Some(""), is_prod)?,
                key_secret: Secret::new(get_env("RAZORPAY_KEY_SECRET", Some(""), is_prod)?),
                webhook_secret: Secret::new(get_env(
                    "RAZORPAY_WEBHOOK_SECRET",
                    Some(""),
                    is_prod,
                )?),
                api_base_url: get_env(
                    "RAZORPAY_API_BASE_URL",
                    Some("https://api.razorpay.com/v1"),
                    false,
                )?,
            },
            auth: TokenSettings {
                issuer: get_env("AUTH_ISSUER", None, is_prod)?,
                audience: get_env("AUTH_AUDIENCE", None, is_prod)?,
                hmac_secret,
                public_key_pem,
                leeway_seconds: parse_env("AUTH_LEEWAY_SECONDS", 30),
            },
            billing: BillingSettings {
                currency: get_env("BILLING_CURRENCY", Some("INR"), false)?,
                free_storage_gb: parse_env("FREE_STORAGE_GB", 1),
                checkout_timeout_minutes: parse_env("CHECKOUT_TIMEOUT_MINUTES", 30),
                renewal_grace_days: parse_env("RENEWAL_GRACE_DAYS", 3),
            },
            rate_limit: RateLimitConfig {
                checkout_attempts: parse_env("CHECKOUT_RATE_LIMIT_ATTEMPTS", 10),
                window_seconds: parse_env("CHECKOUT_RATE_LIMIT_WINDOW_SECONDS", 60),
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}
