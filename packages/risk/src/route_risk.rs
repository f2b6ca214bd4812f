//! Route risk annotation.
//!
//! Samples a route's geometry, attributes each sample to a region and
//! summarizes the risk the route passes through.

use std::{collections::BTreeMap, sync::Arc};

use safewalk_risk_models::{Coordinates, HIGH_RISK_THRESHOLD, Region};
use safewalk_routing_models::Route;
use safewalk_spatial::{RegionLookup, distance_m};
use safewalk_store::RegionRepository;

use crate::RiskError;

/// Default distance between samples along a route, in meters.
pub const DEFAULT_SAMPLE_SPACING_M: f64 = 50.0;

const MAX_SAMPLES_PER_SEGMENT: usize = 200;

/// Risk summary of one route geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRisk {
    pub max_risk_index: f64,
    /// Mean over all samples; samples outside every region count as 0.
    pub average_risk_index: f64,
    /// Region holding the maximum, if any sample fell in a region.
    pub riskiest_region: Option<(i64, String)>,
    /// Distinct regions crossed, in route order.
    pub regions_crossed: Vec<i64>,
}

/// Fills a route's risk fields from current region indexes.
pub struct RouteRiskAnnotator {
    lookup: Arc<dyn RegionLookup>,
    regions: Arc<dyn RegionRepository>,
    threshold: f64,
    sample_spacing_m: f64,
}

impl std::fmt::Debug for RouteRiskAnnotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteRiskAnnotator")
            .field("threshold", &self.threshold)
            .field("sample_spacing_m", &self.sample_spacing_m)
            .finish_non_exhaustive()
    }
}

impl RouteRiskAnnotator {
    #[must_use]
    pub fn new(lookup: Arc<dyn RegionLookup>, regions: Arc<dyn RegionRepository>) -> Self {
        Self {
            lookup,
            regions,
            threshold: HIGH_RISK_THRESHOLD,
            sample_spacing_m: DEFAULT_SAMPLE_SPACING_M,
        }
    }

    /// Index at or above which a route gets a warning.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub const fn with_sample_spacing(mut self, meters: f64) -> Self {
        self.sample_spacing_m = meters;
        self
    }

    /// Summarizes the risk along `geometry`.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError`] if a region cannot be read.
    pub async fn assess(&self, geometry: &[Coordinates]) -> Result<RouteRisk, RiskError> {
        let samples = densify(geometry, self.sample_spacing_m);
        let mut regions: BTreeMap<i64, Option<Region>> = BTreeMap::new();
        let mut crossed = Vec::new();
        let mut total = 0.0;
        let mut max: Option<(f64, i64)> = None;

        for point in &samples {
            let Some(region_id) = self.lookup.region_at(point) else {
                continue;
            };
            if !crossed.contains(&region_id) {
                crossed.push(region_id);
            }
            if !regions.contains_key(&region_id) {
                let region = self.regions.region(region_id).await?;
                regions.insert(region_id, region);
            }
            let Some(Some(region)) = regions.get(&region_id) else {
                continue;
            };

            total += region.risk_index;
            if max.is_none_or(|(current, _)| region.risk_index > current) {
                max = Some((region.risk_index, region_id));
            }
        }

        let riskiest_region = max.and_then(|(_, id)| {
            regions
                .get(&id)
                .and_then(Option::as_ref)
                .map(|r| (r.id, r.name.clone()))
        });

        #[allow(clippy::cast_precision_loss)]
        let average = if samples.is_empty() {
            0.0
        } else {
            total / samples.len() as f64
        };

        Ok(RouteRisk {
            max_risk_index: max.map_or(0.0, |(value, _)| value),
            average_risk_index: (average * 100.0).round() / 100.0,
            riskiest_region,
            regions_crossed: crossed,
        })
    }

    /// Writes the risk fields of `route`.
    ///
    /// # Errors
    ///
    /// Returns [`RiskError`] if a region cannot be read.
    pub async fn annotate(&self, route: &mut Route) -> Result<RouteRisk, RiskError> {
        let risk = self.assess(&route.geometry()).await?;

        route.max_risk_index = risk.max_risk_index;
        route.average_risk_index = risk.average_risk_index;
        route.requires_warning = risk.max_risk_index >= self.threshold;
        route.warning_message = if route.requires_warning {
            let area = risk
                .riskiest_region
                .as_ref()
                .map_or("a high-risk area", |(_, name)| name.as_str());
            Some(format!(
                "Route passes through {area} (risk index {:.0}). Consider an alternative.",
                risk.max_risk_index
            ))
        } else {
            None
        };

        if route.requires_warning {
            log::debug!(
                "{} route flagged: max risk {:.2}, regions {:?}",
                route.provider,
                risk.max_risk_index,
                risk.regions_crossed
            );
        }

        Ok(risk)
    }
}

/// Inserts interpolated points so consecutive samples are at most
/// `spacing_m` apart.
fn densify(geometry: &[Coordinates], spacing_m: f64) -> Vec<Coordinates> {
    let Some(first) = geometry.first() else {
        return Vec::new();
    };
    let spacing_m = if spacing_m.is_finite() && spacing_m > 0.0 {
        spacing_m
    } else {
        DEFAULT_SAMPLE_SPACING_M
    };

    let mut samples = vec![*first];
    for pair in geometry.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let length = distance_m(&a, &b);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let steps = ((length / spacing_m).ceil() as usize).clamp(1, MAX_SAMPLES_PER_SEGMENT);

        for step in 1..steps {
            #[allow(clippy::cast_precision_loss)]
            let t = step as f64 / steps as f64;
            samples.push(Coordinates {
                lat: (b.lat - a.lat).mul_add(t, a.lat),
                lng: (b.lng - a.lng).mul_add(t, a.lng),
            });
        }
        samples.push(b);
    }
    samples
}
