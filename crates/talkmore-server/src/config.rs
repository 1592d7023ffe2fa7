use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use talkmore_api::{AuthMode, LogoutPolicy};

/// Secrets shipped in sample files. Refusing them keeps a copied `.env` from
/// reaching production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me",
    "changeme",
    "secret",
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub auth_mode: AuthMode,
    pub stateless_logout: LogoutPolicy,
    pub heartbeat_interval: Duration,
    pub store_timeout: Duration,
}

impl Config {
    /// Read `TALKMORE_*` variables from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let jwt_secret = lookup("TALKMORE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("TALKMORE_JWT_SECRET is unset or still a placeholder");
        }

        Ok(Self {
            jwt_secret,
            db_path: lookup("TALKMORE_DB_PATH")
                .unwrap_or_else(|| "talkmore.db".into())
                .into(),
            host: lookup("TALKMORE_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "TALKMORE_PORT", 3000)?,
            auth_mode: parse_or(&lookup, "TALKMORE_AUTH_MODE", AuthMode::Checked)?,
            stateless_logout: parse_or(&lookup, "TALKMORE_STATELESS_LOGOUT", LogoutPolicy::Reject)?,
            heartbeat_interval: Duration::from_secs(parse_or(&lookup, "TALKMORE_HEARTBEAT_SECS", 30)?),
            store_timeout: Duration::from_secs(parse_or(&lookup, "TALKMORE_STORE_TIMEOUT_SECS", 10)?),
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
            .with_context(|| format!("invalid {}={:?}", key, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = config(&[("TALKMORE_JWT_SECRET", "a-real-secret-value")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.auth_mode, AuthMode::Checked);
        assert_eq!(config.stateless_logout, LogoutPolicy::Reject);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.store_timeout, Duration::from_secs(10));
        assert_eq!(config.db_path, PathBuf::from("talkmore.db"));
    }

    #[test]
    fn placeholder_secret_is_refused() {
        assert!(config(&[]).is_err());
        assert!(config(&[("TALKMORE_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config(&[
            ("TALKMORE_JWT_SECRET", "a-real-secret-value"),
            ("TALKMORE_PORT", "8080"),
            ("TALKMORE_AUTH_MODE", "stateless"),
            ("TALKMORE_STATELESS_LOGOUT", "noop"),
            ("TALKMORE_HEARTBEAT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.auth_mode, AuthMode::Stateless);
        assert_eq!(config.stateless_logout, LogoutPolicy::Noop);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config(&[
            ("TALKMORE_JWT_SECRET", "a-real-secret-value"),
            ("TALKMORE_PORT", "eighty"),
        ])
        .err()
        .unwrap();
        assert!(format!("{:#}", err).contains("TALKMORE_PORT"));
    }
}
