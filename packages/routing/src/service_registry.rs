//! Compile-time registry of map provider configurations.
//!
//! Each provider is defined in a TOML file under `services/`. The registry
//! embeds these at compile time and exposes them via [`all_services`] and
//! [`enabled_services`]. Credentials never live in the files; each entry
//! names the environment variable holding its key.

use serde::Deserialize;

use crate::quota::QuotaLimit;

/// A map provider configuration loaded from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderService {
    /// Unique identifier, also the adapter's provider name.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether the provider takes part in the fallback chain.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fallback order, lower values are tried first.
    pub priority: u32,
    /// HTTP timeout for a single request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Call budget, if the provider enforces one.
    #[serde(default)]
    pub quota: Option<QuotaLimit>,
    /// Provider-specific configuration.
    pub provider: ProviderConfig,
}

/// Provider-specific configuration, tagged by `type` in TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfig {
    /// Google Directions and Geocoding APIs.
    Google {
        /// API root (e.g., `"https://maps.googleapis.com/maps/api"`).
        base_url: String,
        /// Environment variable holding the API key.
        api_key_env: String,
    },
    /// HERE Routing v8 and Geocoding & Search v7.
    Here {
        /// Routing API root.
        routing_base_url: String,
        /// Forward geocoding API root.
        geocoding_base_url: String,
        /// Reverse geocoding API root.
        reverse_geocoding_base_url: String,
        /// Environment variable holding the API key.
        api_key_env: String,
    },
    /// Mapbox Directions v5 and Geocoding v5.
    Mapbox {
        /// API root (e.g., `"https://api.mapbox.com"`).
        base_url: String,
        /// Environment variable holding the access token.
        api_key_env: String,
    },
    /// Nominatim geocoding with OSRM routing.
    Osm {
        /// Nominatim root.
        nominatim_base_url: String,
        /// OSRM root.
        osrm_base_url: String,
        /// `User-Agent` sent with every request, required by Nominatim.
        user_agent: String,
    },
}

impl ProviderConfig {
    /// Environment variable holding the credential, if the provider needs
    /// one.
    #[must_use]
    pub fn api_key_env(&self) -> Option<&str> {
        match self {
            Self::Google { api_key_env, .. }
            | Self::Here { api_key_env, .. }
            | Self::Mapbox { api_key_env, .. } => Some(api_key_env),
            Self::Osm { .. } => None,
        }
    }
}

const fn default_true() -> bool {
    true
}

const fn default_timeout_secs() -> u64 {
    10
}

/// An embedded service file failed to parse.
#[derive(Debug, thiserror::Error)]
#[error("Failed to parse map provider service '{name}': {source}")]
pub struct RegistryError {
    /// File stem of the broken definition.
    pub name: &'static str,
    /// Parse failure.
    #[source]
    pub source: toml::de::Error,
}

// ── Compile-time embedded TOML files ────────────────────────────────

const SERVICE_TOMLS: &[(&str, &str)] = &[
    ("google", include_str!("../services/google.toml")),
    ("here", include_str!("../services/here.toml")),
    ("mapbox", include_str!("../services/mapbox.toml")),
    ("osm", include_str!("../services/osm.toml")),
];

/// Returns all provider configurations (enabled and disabled).
///
/// # Errors
///
/// Returns [`RegistryError`] if an embedded TOML file is malformed.
pub fn all_services() -> Result<Vec<ProviderService>, RegistryError> {
    SERVICE_TOMLS
        .iter()
        .map(|&(name, toml_str)| {
            toml::de::from_str(toml_str).map_err(|source| RegistryError { name, source })
        })
        .collect()
}

/// Returns only enabled providers, sorted by priority (ascending).
///
/// # Errors
///
/// Returns [`RegistryError`] if an embedded TOML file is malformed.
pub fn enabled_services() -> Result<Vec<ProviderService>, RegistryError> {
    let mut services: Vec<ProviderService> =
        all_services()?.into_iter().filter(|s| s.enabled).collect();
    services.sort_by_key(|s| s.priority);
    Ok(services)
}

/// Moves the providers named in `priority` to the front, in that order.
/// Providers not named keep their relative order after them.
pub fn apply_priority(services: &mut [ProviderService], priority: &[String]) {
    services.sort_by_key(|s| {
        priority
            .iter()
            .position(|id| id.eq_ignore_ascii_case(&s.id))
            .unwrap_or(priority.len())
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn loads_all_services() {
        assert_eq!(all_services().unwrap().len(), SERVICE_TOMLS.len());
    }

    #[test]
    fn service_ids_are_unique() {
        let mut seen = BTreeSet::new();
        for svc in &all_services().unwrap() {
            assert!(seen.insert(svc.id.clone()), "Duplicate service ID: {}", svc.id);
        }
    }

    #[test]
    fn keyed_providers_name_their_env_var() {
        for svc in &all_services().unwrap() {
            match svc.id.as_str() {
                "google" => assert_eq!(svc.provider.api_key_env(), Some("GOOGLE_MAPS_API_KEY")),
                "here" => assert_eq!(svc.provider.api_key_env(), Some("HERE_API_KEY")),
                "mapbox" => assert_eq!(svc.provider.api_key_env(), Some("MAPBOX_ACCESS_TOKEN")),
                "osm" => assert_eq!(svc.provider.api_key_env(), None),
                other => panic!("unexpected service {other}"),
            }
        }
    }

    #[test]
    fn enabled_services_sorted_by_priority() {
        let services = enabled_services().unwrap();
        for window in services.windows(2) {
            assert!(
                window[0].priority <= window[1].priority,
                "Services not sorted by priority: {} ({}) > {} ({})",
                window[0].id,
                window[0].priority,
                window[1].id,
                window[1].priority
            );
        }
    }

    #[test]
    fn priority_override_reorders() {
        let mut services = enabled_services().unwrap();
        apply_priority(&mut services, &["osm".to_string(), "Mapbox".to_string()]);
        let ids: Vec<&str> = services.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["osm", "mapbox", "google", "here"]);
    }
}
