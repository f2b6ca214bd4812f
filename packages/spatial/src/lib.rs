#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! In-memory spatial index for region attribution.
//!
//! Builds an R-tree over region boundary polygons and answers
//! point-in-polygon lookups through the [`RegionLookup`] trait. Points on
//! a boundary belong to the region. Consumers
//! (risk aggregation, alert evaluation, bulk import) only depend on the
//! trait, so the index can be swapped for an external spatial database.
//!
//! Also provides great-circle distances and region seeding from a regular
//! grid or a `GeoJSON` `FeatureCollection`.

pub mod grid;

use geo::{Area, BoundingRect, Distance, Haversine, Intersects, LineString, Polygon};
use geojson::GeoJson;
use rstar::{AABB, RTree, RTreeObject};
use safewalk_risk_models::{Coordinates, Region, ValidationError};

pub use grid::generate_grid;

/// Errors from region seeding.
#[derive(Debug, thiserror::Error)]
pub enum SpatialError {
    /// `GeoJSON` could not be parsed or converted.
    #[error("GeoJSON error: {0}")]
    GeoJson(#[from] geojson::Error),

    /// A boundary failed validation.
    #[error("Invalid region: {0}")]
    Validation(#[from] ValidationError),

    /// Input that parsed but cannot become a region.
    #[error("Unsupported input: {message}")]
    Unsupported {
        /// Description of what was rejected.
        message: String,
    },
}

/// Resolves which region contains a point.
///
/// Implemented by [`RegionIndex`]; an external spatial database can
/// implement it instead.
pub trait RegionLookup: Send + Sync {
    /// Returns the id of the region containing `point`, if any.
    fn region_at(&self, point: &Coordinates) -> Option<i64>;
}

/// A region polygon stored in the R-tree with its metadata.
struct RegionEntry {
    region_id: i64,
    area: f64,
    envelope: AABB<[f64; 2]>,
    polygon: Polygon<f64>,
}

impl RTreeObject for RegionEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

/// Pre-built spatial index over region boundaries.
///
/// Constructed once from the region set and shared behind an `Arc`.
pub struct RegionIndex {
    regions: RTree<RegionEntry>,
}

impl RegionIndex {
    /// Builds the index. Regions whose boundary cannot form a polygon are
    /// skipped with a warning.
    #[must_use]
    pub fn build(regions: &[Region]) -> Self {
        let mut entries = Vec::with_capacity(regions.len());

        for region in regions {
            let polygon = boundary_polygon(&region.boundary);
            let Some(envelope) = compute_envelope(&polygon) else {
                log::warn!("Skipping region {} with empty boundary", region.id);
                continue;
            };
            entries.push(RegionEntry {
                region_id: region.id,
                area: polygon.unsigned_area(),
                envelope,
                polygon,
            });
        }

        let regions = RTree::bulk_load(entries);
        log::debug!("Loaded {} regions into spatial index", regions.size());
        Self { regions }
    }

    /// Number of indexed regions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.size()
    }

    /// Whether the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.size() == 0
    }
}

impl RegionLookup for RegionIndex {
    /// Regions can overlap, and neighbours share edges. The smallest
    /// matching region wins; equal areas go to the lowest id.
    fn region_at(&self, point: &Coordinates) -> Option<i64> {
        let geo_point = geo::Point::new(point.lng, point.lat);
        let query_env = AABB::from_point([point.lng, point.lat]);

        self.regions
            .locate_in_envelope_intersecting(&query_env)
            .filter(|entry| entry.polygon.intersects(&geo_point))
            .min_by(|a, b| {
                a.area
                    .total_cmp(&b.area)
                    .then_with(|| a.region_id.cmp(&b.region_id))
            })
            .map(|e| e.region_id)
    }
}

/// A region boundary prepared for repeated point tests.
#[derive(Debug, Clone)]
pub struct RegionShape {
    polygon: Polygon<f64>,
}

impl RegionShape {
    #[must_use]
    pub fn new(region: &Region) -> Self {
        Self {
            polygon: boundary_polygon(&region.boundary),
        }
    }

    /// Whether `point` lies inside or on the boundary.
    #[must_use]
    pub fn contains(&self, point: &Coordinates) -> bool {
        self.polygon.intersects(&geo::Point::new(point.lng, point.lat))
    }
}

/// Whether `point` lies inside or on the region boundary. Build a
/// [`RegionShape`] instead when testing many points.
#[must_use]
pub fn region_contains(region: &Region, point: &Coordinates) -> bool {
    RegionShape::new(region).contains(point)
}

/// Great-circle distance between two points in meters.
#[must_use]
pub fn distance_m(a: &Coordinates, b: &Coordinates) -> f64 {
    Haversine.distance(geo::Point::new(a.lng, a.lat), geo::Point::new(b.lng, b.lat))
}

/// Center of the boundary's bounding box.
#[must_use]
pub fn boundary_center(boundary: &[Coordinates]) -> Option<Coordinates> {
    let bbox = safewalk_risk_models::BoundingBox::enclosing(boundary)?;
    Some(Coordinates {
        lat: f64::midpoint(bbox.min_lat, bbox.max_lat),
        lng: f64::midpoint(bbox.min_lng, bbox.max_lng),
    })
}

/// Parses a `GeoJSON` `FeatureCollection` into regions.
///
/// Each `Polygon` feature becomes one region named after its `name`
/// property; for a `MultiPolygon` the largest member polygon is used. Ids
/// are assigned sequentially from `first_id`.
///
/// # Errors
///
/// Returns [`SpatialError`] if the document is not a `FeatureCollection`
/// or a feature's geometry is invalid.
pub fn regions_from_geojson(
    geojson_str: &str,
    first_id: i64,
) -> Result<Vec<Region>, SpatialError> {
    let geojson: GeoJson = geojson_str.parse()?;
    let GeoJson::FeatureCollection(collection) = geojson else {
        return Err(SpatialError::Unsupported {
            message: "expected a FeatureCollection".to_string(),
        });
    };

    let mut regions = Vec::new();
    let mut next_id = first_id;

    for (i, feature) in collection.features.into_iter().enumerate() {
        let name = feature
            .property("name")
            .and_then(|v| v.as_str())
            .map_or_else(|| format!("Region {}", i + 1), String::from);

        let Some(geometry) = feature.geometry else {
            log::warn!("Skipping feature {name:?} without geometry");
            continue;
        };

        let geo_geom: geo::Geometry<f64> = geometry.try_into()?;
        let polygon = match geo_geom {
            geo::Geometry::Polygon(p) => p,
            geo::Geometry::MultiPolygon(mp) => {
                let Some(largest) = mp
                    .0
                    .into_iter()
                    .max_by(|a, b| a.unsigned_area().total_cmp(&b.unsigned_area()))
                else {
                    log::warn!("Skipping feature {name:?} with empty MultiPolygon");
                    continue;
                };
                largest
            }
            _ => {
                log::warn!("Skipping feature {name:?}: not a polygon");
                continue;
            }
        };

        let boundary: Vec<Coordinates> = polygon
            .exterior()
            .coords()
            .map(|c| Coordinates { lat: c.y, lng: c.x })
            .collect();

        regions.push(Region::new(next_id, name, boundary)?);
        next_id += 1;
    }

    Ok(regions)
}

/// Builds a `geo` polygon from a boundary ring (`x` = longitude).
fn boundary_polygon(boundary: &[Coordinates]) -> Polygon<f64> {
    let exterior: LineString<f64> = boundary.iter().map(|c| (c.lng, c.lat)).collect();
    Polygon::new(exterior, vec![])
}

/// Compute the bounding box envelope for a polygon.
fn compute_envelope(polygon: &Polygon<f64>) -> Option<AABB<[f64; 2]>> {
    polygon.bounding_rect().map(|rect| {
        AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(id: i64, min_lat: f64, min_lng: f64, size: f64) -> Region {
        Region::new(
            id,
            format!("square {id}"),
            vec![
                Coordinates { lat: min_lat, lng: min_lng },
                Coordinates { lat: min_lat, lng: min_lng + size },
                Coordinates { lat: min_lat + size, lng: min_lng + size },
                Coordinates { lat: min_lat + size, lng: min_lng },
                Coordinates { lat: min_lat, lng: min_lng },
            ],
        )
        .unwrap()
    }

    #[test]
    fn finds_containing_region() {
        let index = RegionIndex::build(&[square(1, 0.0, 0.0, 1.0), square(2, 0.0, 1.0, 1.0)]);
        assert_eq!(index.len(), 2);
        assert_eq!(index.region_at(&Coordinates { lat: 0.5, lng: 0.5 }), Some(1));
        assert_eq!(index.region_at(&Coordinates { lat: 0.5, lng: 1.5 }), Some(2));
        assert_eq!(index.region_at(&Coordinates { lat: 5.0, lng: 5.0 }), None);
    }

    #[test]
    fn smallest_overlapping_region_wins() {
        let index = RegionIndex::build(&[square(1, 0.0, 0.0, 10.0), square(2, 4.0, 4.0, 2.0)]);
        assert_eq!(index.region_at(&Coordinates { lat: 5.0, lng: 5.0 }), Some(2));
        assert_eq!(index.region_at(&Coordinates { lat: 1.0, lng: 1.0 }), Some(1));
    }

    #[test]
    fn shared_grid_edge_resolves_to_one_region() {
        let regions = generate_grid(
            &safewalk_risk_models::BoundingBox {
                min_lat: 0.0,
                min_lng: 0.0,
                max_lat: 1.0,
                max_lng: 2.0,
            },
            1.0,
            1,
            "Cell",
        )
        .unwrap();
        let index = RegionIndex::build(&regions);
        let edge = Coordinates { lat: 0.5, lng: 1.0 };
        let corner = Coordinates { lat: 0.0, lng: 0.0 };

        assert_eq!(index.region_at(&edge), Some(regions[0].id));
        assert_eq!(index.region_at(&corner), Some(regions[0].id));
        assert!(region_contains(&regions[0], &edge));
        assert!(region_contains(&regions[1], &edge));
        assert!(!region_contains(&regions[1], &corner));
    }

    #[test]
    fn contains_handles_concave_boundary() {
        // An L-shaped region: the notch at (1.5, 1.5) is outside.
        let region = Region::new(
            1,
            "L",
            vec![
                Coordinates { lat: 0.0, lng: 0.0 },
                Coordinates { lat: 0.0, lng: 2.0 },
                Coordinates { lat: 1.0, lng: 2.0 },
                Coordinates { lat: 1.0, lng: 1.0 },
                Coordinates { lat: 2.0, lng: 1.0 },
                Coordinates { lat: 2.0, lng: 0.0 },
            ],
        )
        .unwrap();
        assert!(region_contains(&region, &Coordinates { lat: 0.5, lng: 1.5 }));
        assert!(!region_contains(&region, &Coordinates { lat: 1.5, lng: 1.5 }));
    }

    #[test]
    fn haversine_distance() {
        let a = Coordinates { lat: 0.0, lng: 0.0 };
        let b = Coordinates { lat: 0.0, lng: 1.0 };
        let d = distance_m(&a, &b);
        // One degree of longitude at the equator is ~111.2 km.
        assert!((d - 111_195.0).abs() < 500.0, "got {d}");
        assert!(distance_m(&a, &a).abs() < 1e-9);
    }

    #[test]
    fn parses_feature_collection() {
        let doc = r#"{
            "type": "FeatureCollection",
            "features": [
                {
                    "type": "Feature",
                    "properties": { "name": "Downtown" },
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0,0],[1,0],[1,1],[0,1],[0,0]]]
                    }
                },
                {
                    "type": "Feature",
                    "properties": {},
                    "geometry": { "type": "Point", "coordinates": [0, 0] }
                }
            ]
        }"#;
        let regions = regions_from_geojson(doc, 10).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, 10);
        assert_eq!(regions[0].name, "Downtown");
        assert!(region_contains(&regions[0], &Coordinates { lat: 0.5, lng: 0.5 }));
    }

    #[test]
    fn rejects_non_collections() {
        let doc = r#"{ "type": "Point", "coordinates": [0, 0] }"#;
        assert!(matches!(
            regions_from_geojson(doc, 1),
            Err(SpatialError::Unsupported { .. })
        ));
    }
}
