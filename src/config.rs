use anyhow::{bail, Context};

pub const MIN_JWT_SECRET_LEN: usize = 32;

/// Process configuration, read from the environment.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Prefix used to build attachment URLs from storage paths.
    pub storage_public_base: Option<String>,
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        fn str_env(name: &str, default: &str) -> String {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        }

        let secret = std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?;
        if secret.len() < MIN_JWT_SECRET_LEN {
            bail!("JWT_SECRET must be at least {MIN_JWT_SECRET_LEN} characters long");
        }

        let port = str_env("TRACKER_PORT", "8080")
            .parse()
            .context("TRACKER_PORT must be a port number")?;

        Ok(Self {
            host: str_env("TRACKER_HOST", "0.0.0.0"),
            port,
            frontend_url: str_env("FRONTEND_URL", "http://localhost:5173"),
            storage_public_base: std::env::var("STORAGE_PUBLIC_BASE").ok().filter(|s| !s.is_empty()),
            database_url: std::env::var("DATABASE_URL").ok(),
        })
    }
}
