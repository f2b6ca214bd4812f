//! Safety-ranked route planning.

use std::{cmp::Ordering, sync::Arc};

use safewalk_risk::{RiskError, RouteRiskAnnotator};
use safewalk_risk_models::Coordinates;
use safewalk_routing_models::{Route, RouteOptions};

use crate::{MapAdapter, ProviderError};

/// Alternatives requested per plan unless configured otherwise.
pub const DEFAULT_ALTERNATIVES: usize = 3;

/// Errors that can occur while planning.
#[derive(Debug, thiserror::Error)]
pub enum PlannerError {
    /// Every provider failed or the input was invalid.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Region risk could not be read.
    #[error(transparent)]
    Risk(#[from] RiskError),
}

/// Plans routes and orders them safest-first.
pub struct RoutePlanner {
    adapter: Arc<dyn MapAdapter>,
    annotator: RouteRiskAnnotator,
    alternatives: usize,
}

impl std::fmt::Debug for RoutePlanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePlanner")
            .field("provider", &self.adapter.provider_name())
            .field("alternatives", &self.alternatives)
            .finish_non_exhaustive()
    }
}

impl RoutePlanner {
    /// Plans with `adapter`, usually a
    /// [`FallbackMapAdapter`](crate::FallbackMapAdapter), requesting
    /// [`DEFAULT_ALTERNATIVES`] candidates.
    #[must_use]
    pub fn new(adapter: Arc<dyn MapAdapter>, annotator: RouteRiskAnnotator) -> Self {
        Self {
            adapter,
            annotator,
            alternatives: DEFAULT_ALTERNATIVES,
        }
    }

    /// Number of candidates to request. `0` or `1` asks the provider for
    /// a single route only.
    #[must_use]
    pub const fn with_alternatives(mut self, count: usize) -> Self {
        self.alternatives = count;
        self
    }

    /// Fetches candidate routes, annotates each with region risk and
    /// returns them ordered by maximum risk, then average risk, then
    /// duration. Falls back to a single route when the provider returns
    /// no alternatives. `options` applies to both requests.
    ///
    /// # Errors
    ///
    /// * [`PlannerError::Provider`] if no provider could answer
    /// * [`PlannerError::Risk`] if region risk could not be read
    pub async fn plan(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Vec<Route>, PlannerError> {
        let mut routes = if self.alternatives > 1 {
            self.adapter
                .calculate_alternative_routes_with(origin, destination, self.alternatives, options)
                .await?
        } else {
            Vec::new()
        };

        if routes.is_empty() {
            routes.push(
                self.adapter
                    .calculate_route(origin, destination, options)
                    .await?,
            );
        }

        for route in &mut routes {
            self.annotator.annotate(route).await?;
        }

        routes.sort_by(safest_first);

        log::info!(
            "Planned {} route(s) from {origin} to {destination}, safest max risk {:.2}",
            routes.len(),
            routes.first().map_or(0.0, |r| r.max_risk_index)
        );

        Ok(routes)
    }
}

fn safest_first(a: &Route, b: &Route) -> Ordering {
    a.max_risk_index
        .total_cmp(&b.max_risk_index)
        .then_with(|| a.average_risk_index.total_cmp(&b.average_risk_index))
        .then_with(|| a.duration_s.total_cmp(&b.duration_s))
}
