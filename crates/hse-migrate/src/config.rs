use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use hse_storage::RestClientConfig;
use thiserror::Error;

pub const URL_VAR: &str = "NEXT_PUBLIC_SUPABASE_URL";
pub const URL_FALLBACK_VAR: &str = "SUPABASE_URL";
pub const SERVICE_KEY_VAR: &str = "SUPABASE_SERVICE_ROLE_KEY";
pub const DATA_DIR_VAR: &str = "HSE_DATA_DIR";
pub const TIMEOUT_VAR: &str = "HSE_HTTP_TIMEOUT_SECS";

const DEFAULT_DATA_DIR: &str = "./lib";
const DEFAULT_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("{var} must be an http(s) URL, got `{value}`")]
    InvalidUrl { var: &'static str, value: String },
}

#[derive(Clone)]
pub struct MigrateConfig {
    pub supabase_url: String,
    pub service_role_key: String,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
}

impl fmt::Debug for MigrateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrateConfig")
            .field("supabase_url", &self.supabase_url)
            .field("service_role_key", &"<redacted>")
            .field("data_dir", &self.data_dir)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

impl MigrateConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as missing.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let supabase_url = get(URL_VAR)
            .or_else(|| get(URL_FALLBACK_VAR))
            .ok_or(ConfigError::Missing(URL_VAR))?;
        if !(supabase_url.starts_with("http://") || supabase_url.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl {
                var: URL_VAR,
                value: supabase_url,
            });
        }
        let service_role_key = get(SERVICE_KEY_VAR).ok_or(ConfigError::Missing(SERVICE_KEY_VAR))?;

        Ok(Self {
            supabase_url,
            service_role_key,
            data_dir: data_dir_from(&get),
            http_timeout_secs: get(TIMEOUT_VAR)
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }

    pub fn rest_client_config(&self) -> RestClientConfig {
        RestClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(format!("hse-migrate/{}", env!("CARGO_PKG_VERSION"))),
            ..RestClientConfig::new(&self.supabase_url, &self.service_role_key)
        }
    }
}

/// Data directory alone; dry runs and source listings need no credentials.
pub fn data_dir_from_env() -> PathBuf {
    data_dir_from(&|name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
}

fn data_dir_from(get: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    get(DATA_DIR_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn missing_url_is_reported_by_primary_name() {
        let err = MigrateConfig::from_lookup(lookup(&[(SERVICE_KEY_VAR, "k")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(URL_VAR)));
    }

    #[test]
    fn empty_service_key_counts_as_missing() {
        let err = MigrateConfig::from_lookup(lookup(&[
            (URL_VAR, "https://x.supabase.co"),
            (SERVICE_KEY_VAR, "  "),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(SERVICE_KEY_VAR)));
    }

    #[test]
    fn non_http_url_is_rejected() {
        let err = MigrateConfig::from_lookup(lookup(&[
            (URL_VAR, "x.supabase.co"),
            (SERVICE_KEY_VAR, "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }

    #[test]
    fn defaults_and_fallback_url() {
        let config = MigrateConfig::from_lookup(lookup(&[
            (URL_FALLBACK_VAR, "http://localhost:54321"),
            (SERVICE_KEY_VAR, "secret"),
        ]))
        .expect("config");
        assert_eq!(config.supabase_url, "http://localhost:54321");
        assert_eq!(config.data_dir, PathBuf::from("./lib"));
        assert_eq!(config.http_timeout_secs, 20);
        assert!(!format!("{config:?}").contains("secret"));

        let rest = config.rest_client_config();
        assert_eq!(rest.api_key, "secret");
        assert_eq!(rest.timeout, Duration::from_secs(20));
    }

    #[test]
    fn overrides_are_read() {
        let config = MigrateConfig::from_lookup(lookup(&[
            (URL_VAR, "https://x.supabase.co"),
            (SERVICE_KEY_VAR, "k"),
            (DATA_DIR_VAR, "/srv/otp"),
            (TIMEOUT_VAR, "5"),
        ]))
        .expect("config");
        assert_eq!(config.data_dir, PathBuf::from("/srv/otp"));
        assert_eq!(config.http_timeout_secs, 5);
    }
}
