use std::str::FromStr;
use std::sync::LazyLock;

use embed_common::client::EmbedApiClientConfig;
use regex::Regex;

use crate::error::AppError;

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("table name pattern is valid")
});

/// Postgres connection parameters.
#[derive(Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl std::fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Re-embed job configuration loaded from environment variables.
///
/// - `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`: Postgres connection
/// - `RE_EMBED_TABLE` (default `posts`): table with `id`, `content` and `embedding` columns,
///   optionally schema-qualified
/// - `RE_EMBED_CONCURRENCY` (default `1`): records embedded in parallel
/// - `EMBED_API_URL`, `EMBED_API_KEY`, `EMBED_TIMEOUT_SECS`, ...: see [`EmbedApiClientConfig`]
///
/// A missing `EMBED_API_KEY` is not rejected here; the pipeline refuses to run without it.
#[derive(Debug, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub table: String,
    pub concurrency: u32,
    pub client: EmbedApiClientConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let db = DbConfig {
            host: lookup("DB_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&lookup, "DB_PORT", 5432u16)?,
            user: lookup("DB_USER").unwrap_or_else(|| "user".to_string()),
            password: lookup("DB_PASSWORD").unwrap_or_else(|| "password".to_string()),
            database: lookup("DB_NAME").unwrap_or_else(|| "neural_notes".to_string()),
        };

        let table = lookup("RE_EMBED_TABLE").unwrap_or_else(|| "posts".to_string());
        if !TABLE_NAME.is_match(&table) {
            return Err(AppError::Config(format!(
                "RE_EMBED_TABLE is not a valid table name: {table:?}"
            )));
        }

        let concurrency = parse_or(&lookup, "RE_EMBED_CONCURRENCY", 1u32)?;
        if concurrency == 0 {
            return Err(AppError::Config(
                "RE_EMBED_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        let client = EmbedApiClientConfig::from_lookup(&lookup)?;

        Ok(Self {
            db,
            table,
            concurrency,
            client,
        })
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, AppError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| AppError::Config(format!("{name} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}
