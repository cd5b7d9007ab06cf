use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 18652;

/// Ten years. Larger TTLs overflow timestamp arithmetic.
const MAX_TOKEN_TTL_HOURS: i64 = 24 * 365 * 10;
const MAX_RETENTION_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("MORPHEUS_API_HOST is not set")]
    MissingApiHost,

    #[error("MORPHEUS_API_BEARER_TOKEN is not set")]
    MissingApiToken,

    #[error("{key}='{value}' is invalid: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to read {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: dotenvy::Error,
    },
}

/// Connection and runtime settings, read from `config.env` and the process
/// environment (the environment wins).
#[derive(Debug, Clone)]
pub struct Config {
    pub morpheus_host: String,
    pub morpheus_token: String,
    /// Accept self-signed appliance certificates. Default: true.
    pub morpheus_insecure_tls: bool,
    pub poll_interval: Duration,
    pub poll_page_size: u32,
    pub host: String,
    pub port: u16,
    /// Base URL reviewers' links point at. Default: https://localhost:<port>.
    pub public_url: String,
    pub database_url: String,
    /// 64 hex chars. When unset a secret is generated and kept in the database.
    pub token_secret: Option<String>,
    pub token_ttl: chrono::Duration,
    /// Pending approvals older than this are expired by the cleanup job.
    pub retention_days: u32,
    pub apply_timeout: Duration,
    pub apply_max_attempts: u32,
    /// Render a confirm form on GET instead of acting, for mail scanners that
    /// prefetch links. Default: true.
    pub require_confirm: bool,
    pub notify_webhook_url: Option<String>,
    pub notify_webhook_secret: Option<String>,
    pub template_folder: PathBuf,
    pub tls_folder: PathBuf,
    pub approval_config: PathBuf,
}

impl Config {
    /// Load `env_file` into the environment (missing file is only a warning)
    /// and build the config from the environment.
    pub fn load(env_file: &Path) -> Result<Self, ConfigError> {
        match dotenvy::from_path(env_file) {
            Ok(()) => tracing::debug!(path = %env_file.display(), "loaded connection settings"),
            Err(e) if e.not_found() => {
                tracing::warn!(path = %env_file.display(), "env file not found, using process environment only")
            }
            Err(source) => {
                return Err(ConfigError::EnvFile {
                    path: env_file.to_path_buf(),
                    source,
                })
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let morpheus_host = get("MORPHEUS_API_HOST").ok_or(ConfigError::MissingApiHost)?;
        check_url("MORPHEUS_API_HOST", &morpheus_host)?;
        let morpheus_token = get("MORPHEUS_API_BEARER_TOKEN").ok_or(ConfigError::MissingApiToken)?;

        let port = parse_or(&get, "LINK_PORT", DEFAULT_PORT)?;
        let public_url = get("LINK_PUBLIC_URL").unwrap_or_else(|| format!("https://localhost:{}", port));
        check_url("LINK_PUBLIC_URL", &public_url)?;

        let token_secret = get("LINK_TOKEN_SECRET");
        if let Some(secret) = &token_secret {
            crate::token::parse_secret(secret).map_err(|e| ConfigError::InvalidValue {
                key: "LINK_TOKEN_SECRET",
                value: "<redacted>".into(),
                reason: e.to_string(),
            })?;
        }

        let poll_secs: u64 = parse_or(&get, "POLL_INTERVAL", 30)?;
        if poll_secs == 0 {
            return Err(invalid("POLL_INTERVAL", "0", "must be at least 1 second"));
        }
        let poll_page_size: u32 = parse_or(&get, "POLL_PAGE_SIZE", 100)?;
        if poll_page_size == 0 {
            return Err(invalid("POLL_PAGE_SIZE", "0", "must be at least 1"));
        }
        let ttl_hours: i64 = parse_or(&get, "LINK_TOKEN_TTL_HOURS", 24 * 7)?;
        if !(1..=MAX_TOKEN_TTL_HOURS).contains(&ttl_hours) {
            return Err(invalid(
                "LINK_TOKEN_TTL_HOURS",
                &ttl_hours.to_string(),
                &format!("must be between 1 and {}", MAX_TOKEN_TTL_HOURS),
            ));
        }
        let retention_days: u32 = parse_or(&get, "LINK_RETENTION_DAYS", 30)?;
        if !(1..=MAX_RETENTION_DAYS).contains(&retention_days) {
            return Err(invalid(
                "LINK_RETENTION_DAYS",
                &retention_days.to_string(),
                &format!("must be between 1 and {}", MAX_RETENTION_DAYS),
            ));
        }
        let apply_timeout_secs: u64 = parse_or(&get, "LINK_APPLY_TIMEOUT_SECS", 15)?;
        if apply_timeout_secs == 0 {
            return Err(invalid("LINK_APPLY_TIMEOUT_SECS", "0", "must be at least 1 second"));
        }
        let apply_max_attempts: u32 = parse_or(&get, "LINK_APPLY_MAX_ATTEMPTS", 5)?;
        if apply_max_attempts == 0 {
            return Err(invalid("LINK_APPLY_MAX_ATTEMPTS", "0", "must be at least 1"));
        }

        Ok(Config {
            morpheus_host: morpheus_host.trim_end_matches('/').to_string(),
            morpheus_token,
            morpheus_insecure_tls: parse_bool(&get, "MORPHEUS_INSECURE_TLS", true)?,
            poll_interval: Duration::from_secs(poll_secs),
            poll_page_size,
            host: get("LINK_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            public_url: public_url.trim_end_matches('/').to_string(),
            database_url: get("LINK_DATABASE_URL").unwrap_or_else(|| "sqlite://link.db".into()),
            token_secret,
            token_ttl: chrono::Duration::hours(ttl_hours),
            retention_days,
            apply_timeout: Duration::from_secs(apply_timeout_secs),
            apply_max_attempts,
            require_confirm: parse_bool(&get, "LINK_REQUIRE_CONFIRM", true)?,
            notify_webhook_url: get("NOTIFY_WEBHOOK_URL"),
            notify_webhook_secret: get("NOTIFY_WEBHOOK_SECRET"),
            template_folder: get("TEMPLATE_FOLDER").unwrap_or_else(|| "templates".into()).into(),
            tls_folder: get("TLS_FOLDER").unwrap_or_else(|| "certs".into()).into(),
            approval_config: get("APPROVAL_CONFIG").unwrap_or_else(|| "approvals.yaml".into()).into(),
        })
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| invalid(key, &raw, &e.to_string())),
    }
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(v) => Err(invalid(key, &v, "expected true or false")),
    }
}

fn check_url(key: &'static str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| invalid(key, raw, &e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid(key, raw, "scheme must be http or https"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    const REQUIRED: [(&str, &str); 2] = [
        ("MORPHEUS_API_HOST", "https://testhost/"),
        ("MORPHEUS_API_BEARER_TOKEN", "abc123"),
    ];

    #[test]
    fn test_defaults() {
        let cfg = config(&REQUIRED).unwrap();
        assert_eq!(cfg.morpheus_host, "https://testhost");
        assert!(cfg.morpheus_insecure_tls);
        assert_eq!(cfg.poll_interval, Duration::from_secs(30));
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.public_url, "https://localhost:18652");
        assert_eq!(cfg.token_ttl, chrono::Duration::days(7));
        assert_eq!(cfg.apply_timeout, Duration::from_secs(15));
        assert!(cfg.require_confirm);
        assert_eq!(cfg.retention_days, 30);
        assert!(cfg.token_secret.is_none());
        assert_eq!(cfg.template_folder, PathBuf::from("templates"));
    }

    #[test]
    fn test_missing_host_or_token() {
        assert!(matches!(
            config(&[("MORPHEUS_API_BEARER_TOKEN", "abc")]),
            Err(ConfigError::MissingApiHost)
        ));
        assert!(matches!(
            config(&[("MORPHEUS_API_HOST", "https://testhost"), ("MORPHEUS_API_BEARER_TOKEN", "  ")]),
            Err(ConfigError::MissingApiToken)
        ));
    }

    #[test]
    fn test_poll_interval_must_be_an_integer() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("POLL_INTERVAL", "30SECS(STRING)"));
        match config(&pairs) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "POLL_INTERVAL"),
            other => panic!("expected invalid POLL_INTERVAL, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("POLL_INTERVAL", "5"),
            ("LINK_PORT", "9443"),
            ("LINK_PUBLIC_URL", "https://link.example.com/"),
            ("LINK_REQUIRE_CONFIRM", "no"),
            ("MORPHEUS_INSECURE_TLS", "false"),
            ("LINK_TOKEN_TTL_HOURS", "48"),
        ]);
        let cfg = config(&pairs).unwrap();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.port, 9443);
        assert_eq!(cfg.public_url, "https://link.example.com");
        assert!(!cfg.require_confirm);
        assert!(!cfg.morpheus_insecure_tls);
        assert_eq!(cfg.token_ttl, chrono::Duration::hours(48));
    }

    #[test]
    fn test_upper_bounds_accepted() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([("LINK_TOKEN_TTL_HOURS", "87600"), ("LINK_RETENTION_DAYS", "3650")]);
        let cfg = config(&pairs).unwrap();
        let codec = crate::token::TokenCodec::new([1u8; 32], cfg.token_ttl);
        assert!(codec.expires_at(chrono::Utc::now()) > chrono::Utc::now());
    }

    #[test]
    fn test_invalid_values_rejected() {
        for (key, value) in [
            ("MORPHEUS_API_HOST", "testhost"),
            ("LINK_TOKEN_SECRET", "tooshort"),
            ("LINK_REQUIRE_CONFIRM", "maybe"),
            ("POLL_INTERVAL", "0"),
            ("LINK_PORT", "70000"),
            ("LINK_RETENTION_DAYS", "-1"),
            ("LINK_RETENTION_DAYS", "0"),
            ("LINK_RETENTION_DAYS", "100000"),
            ("LINK_APPLY_TIMEOUT_SECS", "0"),
            ("LINK_TOKEN_TTL_HOURS", "0"),
            ("LINK_TOKEN_TTL_HOURS", "20000000000"),
            ("LINK_TOKEN_TTL_HOURS", "87601"),
        ] {
            let mut pairs = REQUIRED.to_vec();
            pairs.retain(|(k, _)| *k != key);
            pairs.push((key, value));
            assert!(
                matches!(config(&pairs), Err(ConfigError::InvalidValue { .. })),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }
}
