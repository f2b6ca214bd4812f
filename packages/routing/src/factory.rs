//! Adapter construction and the fallback composite.
//!
//! [`MapAdapterFactory`] turns the service registry into adapters ordered
//! by priority. [`FallbackMapAdapter`] is itself a [`MapAdapter`]: for each
//! call it validates the input and answers from the cache if any
//! available provider has a fresh entry. Otherwise it walks the providers
//! until one succeeds, claiming a quota slot and running the call through
//! the [`RetryExecutor`] with a hard deadline on every attempt.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use safewalk_risk_models::{Coordinates, ValidationError};
use safewalk_routing_models::{Address, MAX_GEOCODE_RESULTS, Route, RouteOptions, TrafficData};
use serde::{Deserialize, Serialize};

use crate::{
    ErrorCode, MapAdapter, ProviderError,
    adapters::{GoogleMapsAdapter, HereAdapter, MapboxAdapter, OsmAdapter, build_client},
    cache::{CacheKind, TrafficCacheManager},
    quota::QuotaManager,
    retry::RetryExecutor,
    service_registry::{ProviderConfig, ProviderService},
};

/// Provider name reported by the composite.
pub const FALLBACK_NAME: &str = "fallback";

/// Deadline for one provider attempt when none is configured.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct ProviderSlot {
    adapter: Arc<dyn MapAdapter>,
    timeout: Duration,
}

/// Builds and hands out map adapters.
pub struct MapAdapterFactory {
    slots: Vec<ProviderSlot>,
    quota: Arc<QuotaManager>,
    cache: Arc<TrafficCacheManager>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for MapAdapterFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapAdapterFactory")
            .field("providers", &self.provider_names())
            .finish_non_exhaustive()
    }
}

impl MapAdapterFactory {
    /// Wraps ready-made adapters, tried in the given order.
    #[must_use]
    pub fn new(
        adapters: Vec<Arc<dyn MapAdapter>>,
        quota: Arc<QuotaManager>,
        cache: Arc<TrafficCacheManager>,
        retry: RetryExecutor,
    ) -> Self {
        Self {
            slots: adapters
                .into_iter()
                .map(|adapter| ProviderSlot {
                    adapter,
                    timeout: DEFAULT_CALL_TIMEOUT,
                })
                .collect(),
            quota,
            cache,
            retry,
        }
    }

    /// Builds one adapter per enabled service, in slice order, and
    /// registers their quotas. API keys are read from the environment
    /// variables the services name.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if an HTTP client cannot be built.
    pub fn from_services(
        services: &[ProviderService],
        quota: Arc<QuotaManager>,
        cache: Arc<TrafficCacheManager>,
        retry: RetryExecutor,
    ) -> Result<Self, ProviderError> {
        let mut slots = Vec::with_capacity(services.len());

        for service in services.iter().filter(|s| s.enabled) {
            let timeout = Duration::from_secs(service.timeout_secs.max(1));
            let adapter = build_adapter(service, timeout)?;

            if let Some(limit) = service.quota {
                quota.configure(adapter.provider_name(), limit);
            }
            log::debug!(
                "Configured map provider {} (available={}, timeout={timeout:?})",
                service.id,
                adapter.is_available()
            );
            slots.push(ProviderSlot { adapter, timeout });
        }

        Ok(Self {
            slots,
            quota,
            cache,
            retry,
        })
    }

    /// Overrides the per-attempt deadline for every provider.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        for slot in &mut self.slots {
            slot.timeout = timeout;
        }
        self
    }

    /// Provider names in fallback order.
    #[must_use]
    pub fn provider_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.adapter.provider_name()).collect()
    }

    /// Looks up one adapter by provider name.
    #[must_use]
    pub fn adapter(&self, name: &str) -> Option<Arc<dyn MapAdapter>> {
        self.slots
            .iter()
            .find(|s| s.adapter.provider_name().eq_ignore_ascii_case(name))
            .map(|s| Arc::clone(&s.adapter))
    }

    /// The highest-priority available adapter.
    #[must_use]
    pub fn primary(&self) -> Option<Arc<dyn MapAdapter>> {
        self.available().into_iter().next()
    }

    /// Every available adapter, in fallback order.
    #[must_use]
    pub fn available(&self) -> Vec<Arc<dyn MapAdapter>> {
        self.slots
            .iter()
            .filter(|s| s.adapter.is_available())
            .map(|s| Arc::clone(&s.adapter))
            .collect()
    }

    /// Composite adapter walking every provider in order.
    #[must_use]
    pub fn adapter_with_fallback(&self) -> FallbackMapAdapter {
        FallbackMapAdapter {
            slots: self.slots.clone(),
            quota: Arc::clone(&self.quota),
            cache: Arc::clone(&self.cache),
            retry: self.retry.clone(),
        }
    }

    /// Shared quota manager.
    #[must_use]
    pub const fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    /// Shared response cache.
    #[must_use]
    pub const fn cache(&self) -> &Arc<TrafficCacheManager> {
        &self.cache
    }
}

fn build_adapter(
    service: &ProviderService,
    timeout: Duration,
) -> Result<Arc<dyn MapAdapter>, ProviderError> {
    let api_key = service
        .provider
        .api_key_env()
        .and_then(|var| std::env::var(var).ok());

    Ok(match &service.provider {
        ProviderConfig::Google { base_url, .. } => Arc::new(GoogleMapsAdapter::new(
            build_client(&service.id, timeout, None)?,
            base_url.clone(),
            api_key,
        )),
        ProviderConfig::Here {
            routing_base_url,
            geocoding_base_url,
            reverse_geocoding_base_url,
            ..
        } => Arc::new(HereAdapter::new(
            build_client(&service.id, timeout, None)?,
            routing_base_url.clone(),
            geocoding_base_url.clone(),
            reverse_geocoding_base_url.clone(),
            api_key,
        )),
        ProviderConfig::Mapbox { base_url, .. } => Arc::new(MapboxAdapter::new(
            build_client(&service.id, timeout, None)?,
            base_url.clone(),
            api_key,
        )),
        ProviderConfig::Osm {
            nominatim_base_url,
            osrm_base_url,
            user_agent,
        } => Arc::new(OsmAdapter::new(
            build_client(&service.id, timeout, Some(user_agent))?,
            nominatim_base_url.clone(),
            osrm_base_url.clone(),
        )),
    })
}

/// One provider call, described independently of the provider.
#[derive(Debug, Clone, Copy)]
enum ProviderRequest<'a> {
    Route {
        origin: Coordinates,
        destination: Coordinates,
        options: &'a RouteOptions,
    },
    Alternatives {
        origin: Coordinates,
        destination: Coordinates,
        count: usize,
        options: &'a RouteOptions,
    },
    Geocode {
        address: &'a str,
    },
    ReverseGeocode {
        coordinates: Coordinates,
    },
    Traffic {
        route: &'a Route,
    },
}

/// Any provider answer. This is what the cache stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProviderResponse {
    Route(Route),
    Routes(Vec<Route>),
    Addresses(Vec<Address>),
    Address(Address),
    Traffic(TrafficData),
}

impl ProviderRequest<'_> {
    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Route {
                origin,
                destination,
                ..
            }
            | Self::Alternatives {
                origin,
                destination,
                ..
            } => {
                origin.validate()?;
                destination.validate()
            }
            Self::Geocode { address } => {
                if address.trim().is_empty() {
                    Err(ValidationError::EmptyAddress)
                } else {
                    Ok(())
                }
            }
            Self::ReverseGeocode { coordinates } => coordinates.validate(),
            Self::Traffic { route } => route.endpoints().map(|_| ()).ok_or_else(|| {
                ValidationError::Other("route has no decodable geometry".to_string())
            }),
        }
    }

    const fn kind(&self) -> CacheKind {
        match self {
            Self::Route { .. } => CacheKind::Route,
            Self::Alternatives { .. } => CacheKind::Alternatives,
            Self::Geocode { .. } => CacheKind::Geocode,
            Self::ReverseGeocode { .. } => CacheKind::ReverseGeocode,
            Self::Traffic { .. } => CacheKind::Traffic,
        }
    }

    fn cache_key(&self, provider: &str) -> String {
        let kind = self.kind();
        match self {
            Self::Route {
                origin,
                destination,
                options,
            } => TrafficCacheManager::fingerprint(
                kind,
                provider,
                Some(origin),
                Some(destination),
                options,
            ),
            Self::Alternatives {
                origin,
                destination,
                count,
                options,
            } => TrafficCacheManager::fingerprint(
                kind,
                provider,
                Some(origin),
                Some(destination),
                &(count, options),
            ),
            Self::Geocode { address } => TrafficCacheManager::fingerprint(
                kind,
                provider,
                None,
                None,
                &address.trim().to_lowercase(),
            ),
            Self::ReverseGeocode { coordinates } => {
                TrafficCacheManager::fingerprint(kind, provider, Some(coordinates), None, &())
            }
            Self::Traffic { route } => {
                let endpoints = route.endpoints();
                TrafficCacheManager::fingerprint(
                    kind,
                    provider,
                    endpoints.as_ref().map(|(origin, _)| origin),
                    endpoints.as_ref().map(|(_, destination)| destination),
                    &route.polyline,
                )
            }
        }
    }

    async fn send(self, adapter: &dyn MapAdapter) -> Result<ProviderResponse, ProviderError> {
        Ok(match self {
            Self::Route {
                origin,
                destination,
                options,
            } => ProviderResponse::Route(
                adapter.calculate_route(origin, destination, options).await?,
            ),
            Self::Alternatives {
                origin,
                destination,
                count,
                options,
            } => ProviderResponse::Routes(
                adapter
                    .calculate_alternative_routes_with(origin, destination, count, options)
                    .await?,
            ),
            Self::Geocode { address } => {
                ProviderResponse::Addresses(adapter.geocode(address).await?)
            }
            Self::ReverseGeocode { coordinates } => {
                ProviderResponse::Address(adapter.reverse_geocode(coordinates).await?)
            }
            Self::Traffic { route } => {
                ProviderResponse::Traffic(adapter.traffic_data(route).await?)
            }
        })
    }
}

/// Composite [`MapAdapter`] that falls back through every provider.
///
/// Returns the first success. Fails with
/// [`ErrorCode::AllProvidersExhausted`] only when every available provider
/// has failed, with the last provider's error as the cause. Invalid input
/// fails immediately with [`ErrorCode::InvalidRequest`] before any
/// provider is contacted.
#[derive(Clone)]
pub struct FallbackMapAdapter {
    slots: Vec<ProviderSlot>,
    quota: Arc<QuotaManager>,
    cache: Arc<TrafficCacheManager>,
    retry: RetryExecutor,
}

impl std::fmt::Debug for FallbackMapAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let providers: Vec<&str> = self.slots.iter().map(|s| s.adapter.provider_name()).collect();
        f.debug_struct("FallbackMapAdapter")
            .field("providers", &providers)
            .finish_non_exhaustive()
    }
}

impl FallbackMapAdapter {
    fn available_slots(&self) -> impl Iterator<Item = &ProviderSlot> {
        self.slots.iter().filter(|slot| {
            let available = slot.adapter.is_available();
            if !available {
                log::debug!("{}: not configured, skipping", slot.adapter.provider_name());
            }
            available
        })
    }

    /// First fresh cached answer from any available provider, in priority
    /// order.
    fn cached(&self, request: &ProviderRequest<'_>) -> Option<ProviderResponse> {
        self.slots
            .iter()
            .filter(|slot| slot.adapter.is_available())
            .find_map(|slot| {
                let name = slot.adapter.provider_name();
                let cached = self.cache.get::<ProviderResponse>(&request.cache_key(name))?;
                log::debug!("{name}: {} served from cache", request.kind());
                Some(cached)
            })
    }

    async fn dispatch(
        &self,
        request: ProviderRequest<'_>,
    ) -> Result<ProviderResponse, ProviderError> {
        request
            .validate()
            .map_err(|e| ProviderError::invalid_request(FALLBACK_NAME, e))?;

        if let Some(cached) = self.cached(&request) {
            return Ok(cached);
        }

        let kind = request.kind();
        let quota = &self.quota;
        let mut failures: Vec<ProviderError> = Vec::new();

        for slot in self.available_slots() {
            let adapter = slot.adapter.as_ref();
            let name = adapter.provider_name();
            let key = request.cache_key(name);

            if let Err(e) = quota.try_acquire(name) {
                log::warn!("{e}, trying next provider");
                failures.push(e.into());
                continue;
            }

            let timeout = slot.timeout;
            let result = self
                .retry
                .execute(name, |attempt| async move {
                    if attempt > 1 {
                        if let Err(e) = quota.try_acquire(name) {
                            return Err(ProviderError::from(e));
                        }
                    }
                    match tokio::time::timeout(timeout, request.send(adapter)).await {
                        Ok(result) => result,
                        Err(_) => Err(ProviderError::timeout(name, timeout)),
                    }
                })
                .await;

            match result {
                Ok(response) => {
                    self.cache.put(&key, &response, self.cache.ttl_for(kind));
                    return Ok(response);
                }
                Err(e) => {
                    log::warn!("{name}: {kind} failed, trying next provider: {e}");
                    failures.push(e);
                }
            }
        }

        Err(exhausted(kind, failures))
    }
}

fn exhausted(kind: CacheKind, mut failures: Vec<ProviderError>) -> ProviderError {
    let summary = if failures.is_empty() {
        "no provider is available".to_string()
    } else {
        failures
            .iter()
            .map(|e| format!("{} {}", e.provider, e.code))
            .collect::<Vec<_>>()
            .join(", ")
    };
    log::error!("All providers exhausted for {kind}: {summary}");

    let err = ProviderError::new(
        FALLBACK_NAME,
        ErrorCode::AllProvidersExhausted,
        format!("all providers exhausted for {kind} ({summary})"),
    );
    match failures.pop() {
        Some(last) => err.with_cause(last),
        None => err,
    }
}

fn unexpected_response(expected: &str) -> ProviderError {
    ProviderError::new(
        FALLBACK_NAME,
        ErrorCode::InvalidResponse,
        format!("expected {expected} response"),
    )
    .with_retryable(false)
}

#[async_trait]
impl MapAdapter for FallbackMapAdapter {
    fn provider_name(&self) -> &str {
        FALLBACK_NAME
    }

    fn is_available(&self) -> bool {
        self.slots.iter().any(|s| s.adapter.is_available())
    }

    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError> {
        match self
            .dispatch(ProviderRequest::Route {
                origin,
                destination,
                options,
            })
            .await?
        {
            ProviderResponse::Route(route) => Ok(route),
            _ => Err(unexpected_response("route")),
        }
    }

    async fn calculate_alternative_routes_with(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        count: usize,
        options: &RouteOptions,
    ) -> Result<Vec<Route>, ProviderError> {
        if count == 0 {
            origin.validate()?;
            destination.validate()?;
            return Ok(Vec::new());
        }
        match self
            .dispatch(ProviderRequest::Alternatives {
                origin,
                destination,
                count,
                options,
            })
            .await?
        {
            ProviderResponse::Routes(mut routes) => {
                routes.truncate(count);
                Ok(routes)
            }
            _ => Err(unexpected_response("routes")),
        }
    }

    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError> {
        match self.dispatch(ProviderRequest::Geocode { address }).await? {
            ProviderResponse::Addresses(mut addresses) => {
                addresses.truncate(MAX_GEOCODE_RESULTS);
                Ok(addresses)
            }
            _ => Err(unexpected_response("addresses")),
        }
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError> {
        match self
            .dispatch(ProviderRequest::ReverseGeocode { coordinates })
            .await?
        {
            ProviderResponse::Address(address) => Ok(address),
            _ => Err(unexpected_response("address")),
        }
    }

    async fn traffic_data(&self, route: &Route) -> Result<TrafficData, ProviderError> {
        match self.dispatch(ProviderRequest::Traffic { route }).await? {
            ProviderResponse::Traffic(traffic) => Ok(traffic),
            _ => Err(unexpected_response("traffic")),
        }
    }
}
