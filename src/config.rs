use anyhow::{Context, Result};
use chrono::Duration;
use dotenvy::dotenv;
use ipnet::IpNet;
use std::env;
use std::net::IpAddr;
use url::Url;

use crate::engine::EngineConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub public_base_url: String,
    pub checkout_return_url: String,
    pub gateway_base_url: String,
    pub gateway_merchant_id: String,
    pub gateway_api_secret: String,
    pub gateway_timeout_secs: u64,
    pub gateway_retry_attempts: u32,
    pub gateway_retry_base_ms: u64,
    pub operator_api_key: String,
    pub allowed_callback_ips: AllowedIps,
    pub trusted_proxy_depth: usize,
    pub cors_allowed_origins: Vec<String>,
    pub poll_interval_secs: i64,
    pub max_poll_attempts: i32,
    pub max_poll_backoff_secs: i64,
    pub max_poll_window_secs: i64,
    pub reconciler_tick_secs: u64,
    pub reconciler_batch: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let public_base_url = env::var("PUBLIC_BASE_URL")
            .unwrap_or_else(|_| "http://localhost:3000".to_string());
        Url::parse(&public_base_url).context("PUBLIC_BASE_URL is not a valid URL")?;

        let checkout_return_url = env::var("CHECKOUT_RETURN_URL").unwrap_or_else(|_| {
            format!(
                "{}/checkout/complete",
                public_base_url.trim_end_matches('/')
            )
        });
        Url::parse(&checkout_return_url).context("CHECKOUT_RETURN_URL is not a valid URL")?;

        let gateway_base_url =
            env::var("GATEWAY_BASE_URL").context("GATEWAY_BASE_URL must be set")?;
        Url::parse(&gateway_base_url).context("GATEWAY_BASE_URL is not a valid URL")?;

        let allowed_callback_ips = parse_allowed_ips(
            &env::var("ALLOWED_CALLBACK_IPS").unwrap_or_else(|_| "*".to_string()),
        )?;

        let cors_allowed_origins = env::var("CORS_ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|entry| !entry.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Config {
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            public_base_url,
            checkout_return_url,
            gateway_base_url,
            gateway_merchant_id: env::var("GATEWAY_MERCHANT_ID")
                .context("GATEWAY_MERCHANT_ID must be set")?,
            gateway_api_secret: env::var("GATEWAY_API_SECRET")
                .context("GATEWAY_API_SECRET must be set")?,
            gateway_timeout_secs: env::var("GATEWAY_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            gateway_retry_attempts: env::var("GATEWAY_RETRY_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            gateway_retry_base_ms: env::var("GATEWAY_RETRY_BASE_MS")
                .unwrap_or_else(|_| "200".to_string())
                .parse()?,
            operator_api_key: env::var("OPERATOR_API_KEY")
                .context("OPERATOR_API_KEY must be set")?,
            allowed_callback_ips,
            trusted_proxy_depth: env::var("TRUSTED_PROXY_DEPTH")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            cors_allowed_origins,
            poll_interval_secs: env::var("POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            max_poll_attempts: env::var("MAX_POLL_ATTEMPTS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            max_poll_backoff_secs: env::var("MAX_POLL_BACKOFF_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()?,
            max_poll_window_secs: env::var("MAX_POLL_WINDOW_SECS")
                .unwrap_or_else(|_| "21600".to_string())
                .parse()?,
            reconciler_tick_secs: env::var("RECONCILER_TICK_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            reconciler_batch: env::var("RECONCILER_BATCH")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
        })
    }

    /// Where the gateway posts asynchronous payment results.
    pub fn callback_url(&self) -> String {
        format!(
            "{}/callbacks/hosted-checkout",
            self.public_base_url.trim_end_matches('/')
        )
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::seconds(self.poll_interval_secs),
            max_poll_attempts: self.max_poll_attempts,
            max_poll_backoff: Duration::seconds(self.max_poll_backoff_secs),
            max_poll_window: Duration::seconds(self.max_poll_window_secs),
            gateway_retry_attempts: self.gateway_retry_attempts,
            gateway_retry_base_ms: self.gateway_retry_base_ms,
            return_url: self.checkout_return_url.clone(),
            callback_url: self.callback_url(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AllowedIps {
    Any,
    Cidrs(Vec<IpNet>),
}

impl AllowedIps {
    pub fn permits(&self, ip: IpAddr) -> bool {
        match self {
            AllowedIps::Any => true,
            AllowedIps::Cidrs(cidrs) => cidrs.iter().any(|cidr| cidr.contains(&ip)),
        }
    }
}

fn parse_allowed_ips(raw: &str) -> Result<AllowedIps> {
    let value = raw.trim();
    if value == "*" {
        return Ok(AllowedIps::Any);
    }

    let cidrs = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::parse::<IpNet>)
        .collect::<Result<Vec<_>, _>>()?;

    if cidrs.is_empty() {
        anyhow::bail!("ALLOWED_CALLBACK_IPS must be '*' or a comma-separated list of CIDRs");
    }

    Ok(AllowedIps::Cidrs(cidrs))
}
