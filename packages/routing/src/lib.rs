#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Map provider integration.
//!
//! Every provider (Google, HERE, Mapbox, `OpenStreetMap`) implements
//! [`MapAdapter`]. The [`factory::MapAdapterFactory`] builds them from the
//! embedded service registry and hands out a [`factory::FallbackMapAdapter`]
//! that walks the providers in priority order, consulting the
//! [`quota::QuotaManager`], retrying transient failures through the
//! [`retry::RetryExecutor`] and caching responses in the
//! [`cache::TrafficCacheManager`].

pub mod adapters;
pub mod cache;
pub mod factory;
pub mod planner;
pub mod quota;
pub mod retry;
pub mod service_registry;

use std::time::Duration;

use async_trait::async_trait;
use safewalk_risk_models::{Coordinates, ValidationError};
use safewalk_routing_models::{Address, Route, RouteOptions, TrafficData};
use strum_macros::{AsRefStr, Display};

pub use cache::TrafficCacheManager;
pub use factory::{FallbackMapAdapter, MapAdapterFactory};
pub use planner::{PlannerError, RoutePlanner};
pub use quota::QuotaManager;
pub use retry::{RetryExecutor, RetryPolicy};

/// Classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    /// Connection or request transport failure.
    Network,
    /// The provider did not answer in time.
    Timeout,
    /// The provider throttled the request.
    RateLimited,
    /// The local call budget for the provider is spent.
    QuotaExceeded,
    /// The provider failed internally (5xx or equivalent).
    ServerError,
    /// The provider answered with something that could not be decoded.
    InvalidResponse,
    /// The request was rejected as malformed.
    InvalidRequest,
    /// Missing or rejected credentials.
    Unauthorized,
    /// The provider found nothing for the request.
    NotFound,
    /// The provider does not offer the operation.
    Unsupported,
    /// A failure the adapter could not classify.
    Unexpected,
    /// Retries were exhausted.
    MaxRetriesExceeded,
    /// Every configured provider failed.
    AllProvidersExhausted,
}

impl ErrorCode {
    /// Whether failures with this code are worth retrying by default.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::ServerError
                | Self::InvalidResponse
                | Self::Unexpected
        )
    }
}

/// Failure of a map provider operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}: {message} ({code})")]
pub struct ProviderError {
    /// Provider that failed, or `fallback` for the composite.
    pub provider: String,
    /// Failure classification.
    pub code: ErrorCode,
    /// Whether the same call may succeed if repeated.
    pub retryable: bool,
    /// Human-readable detail.
    pub message: String,
    /// The failure this one wraps, if any.
    #[source]
    pub cause: Option<Box<ProviderError>>,
}

impl ProviderError {
    /// Creates an error whose retryability follows its code.
    #[must_use]
    pub fn new(provider: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            code,
            retryable: code.is_transient(),
            message: message.into(),
            cause: None,
        }
    }

    /// Wraps an unclassified failure. Treated as retryable.
    #[must_use]
    pub fn unexpected(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(provider, ErrorCode::Unexpected, err.to_string())
    }

    /// A per-attempt deadline expired.
    #[must_use]
    pub fn timeout(provider: impl Into<String>, after: Duration) -> Self {
        Self::new(
            provider,
            ErrorCode::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    /// Malformed input. Never retryable.
    #[must_use]
    pub fn invalid_request(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::new(provider, ErrorCode::InvalidRequest, err.to_string())
    }

    /// Undecodable or unexpected payload.
    #[must_use]
    pub fn invalid_response(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(provider, ErrorCode::InvalidResponse, message)
    }

    /// Overrides the retry classification.
    #[must_use]
    pub const fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Attaches the failure this one wraps.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Whether every provider failed, which callers should surface as
    /// "service unavailable".
    #[must_use]
    pub fn is_service_unavailable(&self) -> bool {
        self.code == ErrorCode::AllProvidersExhausted
    }

    /// Whether the failure was caused by the caller's input.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        self.code == ErrorCode::InvalidRequest
    }

    /// The innermost wrapped failure, or `self`.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        let mut current = self;
        while let Some(cause) = &current.cause {
            current = cause;
        }
        current
    }
}

impl From<ValidationError> for ProviderError {
    fn from(err: ValidationError) -> Self {
        Self::invalid_request("input", err)
    }
}

impl From<quota::QuotaExceeded> for ProviderError {
    fn from(err: quota::QuotaExceeded) -> Self {
        Self::new(err.provider.clone(), ErrorCode::QuotaExceeded, err.to_string())
    }
}

/// A map data provider.
///
/// Implementations translate provider payloads into the neutral types of
/// `safewalk_routing_models`. Routes always carry Google-format polylines.
#[async_trait]
pub trait MapAdapter: Send + Sync {
    /// Stable lowercase provider identifier (`google`, `here`, ...).
    fn provider_name(&self) -> &str;

    /// Whether the adapter is configured well enough to be tried. Must not
    /// touch the network.
    fn is_available(&self) -> bool;

    /// Best route between two points.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails or finds no route.
    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError>;

    /// Up to `count` walking routes in the provider's preference order.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails.
    async fn calculate_alternative_routes(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        count: usize,
    ) -> Result<Vec<Route>, ProviderError> {
        self.calculate_alternative_routes_with(
            origin,
            destination,
            count,
            &RouteOptions::default(),
        )
        .await
    }

    /// Up to `count` routes for the given mode and avoid flags, in the
    /// provider's preference order.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails.
    async fn calculate_alternative_routes_with(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        count: usize,
        options: &RouteOptions,
    ) -> Result<Vec<Route>, ProviderError>;

    /// Forward geocoding, at most
    /// [`MAX_GEOCODE_RESULTS`](safewalk_routing_models::MAX_GEOCODE_RESULTS)
    /// results.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails.
    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError>;

    /// Reverse geocoding to the closest address.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails or knows no address
    /// there.
    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError>;

    /// Live traffic along a previously computed route.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError`] if the provider fails or does not offer
    /// traffic data.
    async fn traffic_data(&self, route: &Route) -> Result<TrafficData, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_code() {
        assert!(ProviderError::new("google", ErrorCode::Timeout, "slow").retryable);
        assert!(ProviderError::unexpected("google", "boom").retryable);
        assert!(!ProviderError::new("google", ErrorCode::Unauthorized, "bad key").retryable);
        assert!(!ProviderError::from(ValidationError::EmptyAddress).retryable);
    }

    #[test]
    fn root_cause_walks_chain() {
        let inner = ProviderError::new("here", ErrorCode::ServerError, "502");
        let outer = ProviderError::new("fallback", ErrorCode::AllProvidersExhausted, "all failed")
            .with_cause(
                ProviderError::new("here", ErrorCode::MaxRetriesExceeded, "gave up")
                    .with_cause(inner),
            );
        assert!(outer.is_service_unavailable());
        assert_eq!(outer.root_cause().code, ErrorCode::ServerError);
        assert!(std::error::Error::source(&outer).is_some());
    }
}
