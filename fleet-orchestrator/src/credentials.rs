use async_trait::async_trait;
use fleet_common::ConfigError;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use std::env;
use std::fs;

/// Maps an account access key to its secret.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve_secret(&self, access_key: &str) -> Result<String, ConfigError>;
}

fn non_blank(access_key: &str, secret: Option<String>) -> Result<String, ConfigError> {
    secret
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingCredential(access_key.to_string()))
}

/// Reads `accounts.account_secret`.
pub struct PgSecretResolver {
    db: Pool<Postgres>,
}

impl PgSecretResolver {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SecretResolver for PgSecretResolver {
    async fn resolve_secret(&self, access_key: &str) -> Result<String, ConfigError> {
        let secret: Option<String> = sqlx::query_scalar(
            "SELECT account_secret FROM accounts WHERE account_key = $1 AND deleted_at IS NULL",
        )
        .bind(access_key)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| ConfigError::Credential {
            access_key: access_key.to_string(),
            reason: e.to_string(),
        })?;
        non_blank(access_key, secret)
    }
}

/// Secrets from the environment. `FLEET_SECRET_<KEY>_FILE` (a mounted secret
/// file) wins over the inline `FLEET_SECRET_<KEY>`.
#[derive(Debug, Default)]
pub struct EnvSecretResolver;

impl EnvSecretResolver {
    pub fn var_name(access_key: &str) -> String {
        let key: String = access_key
            .trim()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("FLEET_SECRET_{}", key)
    }
}

#[async_trait]
impl SecretResolver for EnvSecretResolver {
    async fn resolve_secret(&self, access_key: &str) -> Result<String, ConfigError> {
        let var = Self::var_name(access_key);
        let from_file = match env::var(format!("{}_FILE", var)) {
            Ok(path) => Some(fs::read_to_string(&path).map_err(|e| ConfigError::Credential {
                access_key: access_key.to_string(),
                reason: format!("{}: {}", path, e),
            })?),
            Err(_) => None,
        };
        non_blank(access_key, from_file.or_else(|| env::var(&var).ok()))
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticSecretResolver {
    secrets: HashMap<String, String>,
}

impl StaticSecretResolver {
    pub fn new<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            secrets: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

#[async_trait]
impl SecretResolver for StaticSecretResolver {
    async fn resolve_secret(&self, access_key: &str) -> Result<String, ConfigError> {
        non_blank(access_key, self.secrets.get(access_key).cloned())
    }
}
