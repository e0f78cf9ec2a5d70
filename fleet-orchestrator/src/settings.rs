use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Where account secrets are looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    Database,
    Env,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// Largest count sent to a single `batch_create` call.
    pub batch_max: usize,
    /// Outer attempts made by `expand_in_deed`.
    pub expand_retry: usize,
    pub repair_attempts: u32,
    pub repair_backoff: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            batch_max: 100,
            expand_retry: 3,
            repair_attempts: 3,
            repair_backoff: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub listen_addr: String,
    pub secret_source: SecretSource,
    pub engine: EngineSettings,
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{} is not a valid value: {:?}", name, raw)),
        _ => Ok(default),
    }
}

impl Settings {
    /// Reads the process environment. Call `dotenv::dotenv()` first to pick
    /// up a local `.env`.
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let defaults = EngineSettings::default();

        let batch_max: usize = parse_var("FLEET_BATCH_MAX", defaults.batch_max)?;
        if batch_max == 0 {
            anyhow::bail!("FLEET_BATCH_MAX must be at least 1");
        }
        let expand_retry: usize = parse_var("FLEET_EXPAND_RETRY", defaults.expand_retry)?;
        let repair_attempts: u32 = parse_var("FLEET_REPAIR_ATTEMPTS", defaults.repair_attempts)?;
        let backoff_ms: u64 = parse_var(
            "FLEET_REPAIR_BACKOFF_MS",
            defaults.repair_backoff.as_millis() as u64,
        )?;

        let secret_source = match env::var("FLEET_SECRET_SOURCE")
            .unwrap_or_else(|_| "db".to_string())
            .trim()
            .to_lowercase()
            .as_str()
        {
            "db" | "database" => SecretSource::Database,
            "env" => SecretSource::Env,
            other => anyhow::bail!("FLEET_SECRET_SOURCE must be db or env, got {:?}", other),
        };

        Ok(Self {
            database_url,
            database_max_connections: parse_var("DATABASE_MAX_CONNECTIONS", 5)?,
            listen_addr: env::var("FLEET_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8004".to_string()),
            secret_source,
            engine: EngineSettings {
                batch_max,
                expand_retry: expand_retry.max(1),
                repair_attempts: repair_attempts.max(1),
                repair_backoff: Duration::from_millis(backoff_ms),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env vars are process-global; keep every mutation in one test.
    #[test]
    fn from_env_reads_overrides_and_rejects_garbage() {
        let saved_url = env::var("DATABASE_URL").ok();
        env::set_var("DATABASE_URL", "postgres://localhost/fleet");
        env::set_var("FLEET_BATCH_MAX", "25");
        env::set_var("FLEET_REPAIR_BACKOFF_MS", "5");
        env::set_var("FLEET_SECRET_SOURCE", "env");
        let s = Settings::from_env().unwrap();
        assert_eq!(s.engine.batch_max, 25);
        assert_eq!(s.engine.expand_retry, 3);
        assert_eq!(s.engine.repair_backoff, Duration::from_millis(5));
        assert_eq!(s.secret_source, SecretSource::Env);

        env::set_var("FLEET_BATCH_MAX", "lots");
        assert!(Settings::from_env().is_err());
        env::set_var("FLEET_BATCH_MAX", "0");
        assert!(Settings::from_env().is_err());

        for k in ["FLEET_BATCH_MAX", "FLEET_REPAIR_BACKOFF_MS", "FLEET_SECRET_SOURCE"] {
            env::remove_var(k);
        }
        match saved_url {
            Some(url) => env::set_var("DATABASE_URL", url),
            None => env::remove_var("DATABASE_URL"),
        }
    }

    #[test]
    fn engine_defaults() {
        let d = EngineSettings::default();
        assert_eq!((d.batch_max, d.expand_retry, d.repair_attempts), (100, 3, 3));
        assert_eq!(d.repair_backoff, Duration::from_millis(10));
    }
}
