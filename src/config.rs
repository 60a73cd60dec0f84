//! Process configuration, loaded once from the environment.
//!
//! Every recognized option is named explicitly (§6.3); there is no
//! reflection-based field resolution.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_env: String,
    pub database_url: Option<String>,
    pub demo_mode: bool,
    pub bingx_api_key: Option<String>,
    pub bingx_secret_key: Option<String>,
    pub frontend_url: Option<String>,
    pub port: u16,
    pub auto_start_bot: bool,
    pub log_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let app_env = std::env::var("APP_ENV")
            .or_else(|_| std::env::var("NODE_ENV"))
            .unwrap_or_else(|_| "production".to_string());
        let is_dev = app_env == "development";

        let database_url = std::env::var("DATABASE_URL").ok();
        if database_url.is_none() && !is_dev {
            anyhow::bail!("DATABASE_URL is required outside development (APP_ENV={app_env})");
        }

        let demo_mode = env_bool("DEMO_MODE");

        let bingx_api_key = std::env::var("BINGX_API_KEY").ok();
        let bingx_secret_key = std::env::var("BINGX_SECRET_KEY").ok();
        if !demo_mode && (bingx_api_key.is_none() || bingx_secret_key.is_none()) {
            // Public endpoints still work without credentials; private
            // endpoints fail fast later with a typed AUTH error per §6.3.
        }

        let frontend_url = std::env::var("FRONTEND_URL").ok();

        let port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(3001);

        let auto_start_bot = env_bool("AUTO_START_BOT");
        let log_dir = std::env::var("LOG_DIR").ok();

        Ok(Self {
            app_env,
            database_url,
            demo_mode,
            bingx_api_key,
            bingx_secret_key,
            frontend_url,
            port,
            auto_start_bot,
            log_dir,
        })
    }

    pub fn is_dev(&self) -> bool {
        self.app_env == "development"
    }

    /// Resolve the persistent store location, falling back to an embedded
    /// SQLite file in development when `DATABASE_URL` is absent.
    pub fn resolve_database_path(&self) -> Result<String> {
        if let Some(url) = &self.database_url {
            return Ok(url.clone());
        }
        anyhow::ensure!(self.is_dev(), "DATABASE_URL missing outside development");
        std::fs::create_dir_all("./data").context("creating ./data directory")?;
        Ok("./data/dev.sqlite3".to_string())
    }
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}
