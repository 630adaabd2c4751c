//! Server configuration

use anyhow::Context;
use netpass_billing::GatewayConfig;

/// Runtime configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// Origins allowed by CORS. Defaults to localhost for development;
    /// production sets ALLOWED_ORIGINS.
    pub allowed_origins: Vec<String>,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        let gateway = GatewayConfig::from_env().context("gateway configuration")?;

        Ok(Self {
            database_url,
            bind_address,
            allowed_origins,
            gateway,
        })
    }
}
