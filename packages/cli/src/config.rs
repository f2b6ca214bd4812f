//! Application configuration.
//!
//! Read from the TOML file given with `--config` or `SAFEWALK_CONFIG`,
//! otherwise from the embedded `default.toml`. Every section falls back to
//! its type's defaults, so a file only needs the values it changes.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use safewalk_alerts::AlertConfig;
use safewalk_jobs::{AnonymizeConfig, ScheduleConfig};
use safewalk_risk::RiskConfig;
use safewalk_routing::{
    RetryPolicy,
    cache::CacheConfig,
    quota::QuotaLimit,
    service_registry::{ProviderService, apply_priority},
};
use serde::Deserialize;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "SAFEWALK_CONFIG";

const DEFAULT_TOML: &str = include_str!("default.toml");

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub retry: RetryPolicy,
    pub cache: CacheConfig,
    pub risk: RiskConfig,
    pub alerts: AlertConfig,
    pub anonymize: AnonymizeConfig,
    pub schedule: ScheduleConfig,
    pub providers: ProvidersConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider ids tried first, in order.
    pub priority: Vec<String>,
    /// Quota overrides by provider id.
    pub quota: BTreeMap<String, QuotaLimit>,
    /// Per-attempt deadline overriding each service's own timeout.
    pub call_timeout_secs: Option<u64>,
}

impl ProvidersConfig {
    /// Applies the priority order and quota overrides to the registry.
    pub fn apply(&self, services: &mut [ProviderService]) {
        apply_priority(services, &self.priority);
        for service in services.iter_mut() {
            if let Some(limit) = self.quota.get(&service.id) {
                service.quota = Some(*limit);
            }
        }
    }
}

impl AppConfig {
    /// Loads `path`, else the file named by [`CONFIG_ENV`], else the
    /// embedded defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        match path.map(Path::to_path_buf).or(from_env) {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
                log::debug!("Loaded config from {}", path.display());
                Self::parse(&text)
            }
            None => Self::parse(DEFAULT_TOML),
        }
    }

    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML or mistyped
    /// values.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use safewalk_routing::service_registry::all_services;

    use super::*;

    #[test]
    fn embedded_defaults_match_type_defaults() {
        let config = AppConfig::parse(DEFAULT_TOML).unwrap();
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.cache, CacheConfig::default());
        assert_eq!(config.risk, RiskConfig::default());
        assert_eq!(config.alerts, AlertConfig::default());
        assert_eq!(config.anonymize, AnonymizeConfig::default());
        assert_eq!(config.schedule, ScheduleConfig::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = AppConfig::parse(
            r#"
            [retry]
            max_retries = 1

            [providers]
            priority = ["osm"]

            [providers.quota.google]
            limit = 10
            window_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, RetryPolicy::default().base_delay_ms);
        assert_eq!(config.risk, RiskConfig::default());

        let mut services = all_services().unwrap();
        config.providers.apply(&mut services);
        assert_eq!(services[0].id, "osm");
        let google = services.iter().find(|s| s.id == "google").unwrap();
        assert_eq!(
            google.quota,
            Some(QuotaLimit {
                limit: 10,
                window_secs: 60,
            })
        );
    }

    #[test]
    fn mistyped_value_is_rejected() {
        let err = AppConfig::parse("[risk]\nwindow_days = \"thirty\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_reported_with_its_path() {
        let err = AppConfig::load(Some(Path::new("/nonexistent/safewalk.toml"))).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/safewalk.toml"));
    }
}
