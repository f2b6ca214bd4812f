//! Regular grid seeding for cities without official neighborhood
//! boundaries.

use safewalk_risk_models::{BoundingBox, Coordinates, Region, ValidationError};

/// Covers `bbox` with square cells of `cell_size_deg` degrees.
///
/// Cells are emitted row by row from the south-west corner and numbered
/// sequentially from `first_id`. Edge cells are clipped to the box.
///
/// # Errors
///
/// Returns [`ValidationError`] if the box corners are invalid, the box is
/// empty, or the cell size is not positive.
pub fn generate_grid(
    bbox: &BoundingBox,
    cell_size_deg: f64,
    first_id: i64,
    name_prefix: &str,
) -> Result<Vec<Region>, ValidationError> {
    Coordinates::new(bbox.min_lat, bbox.min_lng)?;
    Coordinates::new(bbox.max_lat, bbox.max_lng)?;
    if !(cell_size_deg.is_finite() && cell_size_deg > 0.0) {
        return Err(ValidationError::Other(format!(
            "cell size must be positive, got {cell_size_deg}"
        )));
    }
    if bbox.min_lat >= bbox.max_lat || bbox.min_lng >= bbox.max_lng {
        return Err(ValidationError::Other("bounding box is empty".to_string()));
    }

    let rows = cell_count(bbox.max_lat - bbox.min_lat, cell_size_deg);
    let cols = cell_count(bbox.max_lng - bbox.min_lng, cell_size_deg);

    let mut regions = Vec::with_capacity((rows * cols) as usize);
    let mut id = first_id;

    for row in 0..rows {
        let lat = bbox.min_lat + f64::from(row) * cell_size_deg;
        let top = (lat + cell_size_deg).min(bbox.max_lat);

        for col in 0..cols {
            let lng = bbox.min_lng + f64::from(col) * cell_size_deg;
            let right = (lng + cell_size_deg).min(bbox.max_lng);
            let boundary = vec![
                Coordinates { lat, lng },
                Coordinates { lat, lng: right },
                Coordinates { lat: top, lng: right },
                Coordinates { lat: top, lng },
                Coordinates { lat, lng },
            ];
            regions.push(Region::new(id, format!("{name_prefix} {row}-{col}"), boundary)?);
            id += 1;
        }
    }

    Ok(regions)
}

/// Number of cells needed to span `extent`, tolerating float noise.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn cell_count(extent: f64, cell_size: f64) -> u32 {
    (extent / cell_size - 1e-9).ceil().max(1.0) as u32
}
