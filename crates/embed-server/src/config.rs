use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use embed_common::embedding::EmbeddingModelKind;

use crate::error::AppError;

/// Server configuration loaded from environment variables.
///
/// All variables are optional:
/// - `EMBED_API_HOST` (default `0.0.0.0`), `EMBED_API_PORT` (default `8001`)
/// - `EMBED_API_KEY`: bearer secret. When absent every `/embed` and `/query-embedding`
///   request is rejected with 401; the server still starts so `/health` keeps answering.
/// - `EMBED_MODEL` (default `all-MiniLM-L6-v2`), `EMBED_MODEL_CACHE_DIR`
/// - `EMBED_INIT_RETRY_BACKOFF_MS` (default `0`): fail-fast window after a failed model load
/// - `EMBED_WARMUP` (default `false`): start loading the model in the background at startup
#[derive(Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub model: EmbeddingModelKind,
    pub model_cache_dir: Option<PathBuf>,
    pub init_retry_backoff: Duration,
    pub warmup: bool,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("model_cache_dir", &self.model_cache_dir)
            .field("init_retry_backoff", &self.init_retry_backoff)
            .field("warmup", &self.warmup)
            .finish()
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let host = lookup("EMBED_API_HOST").unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_or(&lookup, "EMBED_API_PORT", 8001u16)?;
        let api_key = lookup("EMBED_API_KEY").filter(|k| !k.trim().is_empty());

        let model = match lookup("EMBED_MODEL") {
            Some(name) => name.parse::<EmbeddingModelKind>()?,
            None => EmbeddingModelKind::AllMiniLmL6V2,
        };
        let model_cache_dir = lookup("EMBED_MODEL_CACHE_DIR").map(PathBuf::from);

        let init_retry_backoff =
            Duration::from_millis(parse_or(&lookup, "EMBED_INIT_RETRY_BACKOFF_MS", 0u64)?);

        let warmup = match lookup("EMBED_WARMUP") {
            Some(v) => parse_bool(&v).ok_or_else(|| {
                AppError::Config(format!("EMBED_WARMUP must be a boolean, got {v:?}"))
            })?,
            None => false,
        };

        Ok(Self {
            host,
            port,
            api_key,
            model,
            model_cache_dir,
            init_retry_backoff,
            warmup,
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

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8001);
        assert!(config.api_key.is_none());
        assert_eq!(config.model, EmbeddingModelKind::AllMiniLmL6V2);
        assert_eq!(config.init_retry_backoff, Duration::ZERO);
        assert!(!config.warmup);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("EMBED_API_PORT", "9000"),
            ("EMBED_API_KEY", "secret"),
            ("EMBED_MODEL", "BAAI/bge-small-en-v1.5"),
            ("EMBED_INIT_RETRY_BACKOFF_MS", "250"),
            ("EMBED_WARMUP", "yes"),
        ])
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.model, EmbeddingModelKind::BgeSmallEnV15);
        assert_eq!(config.init_retry_backoff, Duration::from_millis(250));
        assert!(config.warmup);
        assert!(!format!("{config:?}").contains("secret"));
    }

    #[test]
    fn test_blank_api_key_is_absent() {
        let config = config_from(&[("EMBED_API_KEY", "  ")]).unwrap();
        assert!(config.api_key.is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(
            config_from(&[("EMBED_API_PORT", "eighty")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("EMBED_WARMUP", "maybe")]),
            Err(AppError::Config(_))
        ));
        assert!(matches!(
            config_from(&[("EMBED_MODEL", "word2vec")]),
            Err(AppError::Common(_))
        ));
    }
}
