//! Google encoded polyline codec (precision 5).
//!
//! See <https://developers.google.com/maps/documentation/utilities/polylinealgorithm>

use safewalk_risk_models::Coordinates;

const FACTOR: f64 = 1e5;

/// Error returned when a polyline string is truncated or contains
/// characters outside the encoding alphabet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidPolylineError {
    /// Byte offset where decoding failed.
    pub position: usize,
}

impl std::fmt::Display for InvalidPolylineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid encoded polyline at byte {}", self.position)
    }
}

impl std::error::Error for InvalidPolylineError {}

/// Encodes a sequence of coordinates.
#[must_use]
pub fn encode(points: &[Coordinates]) -> String {
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat = 0_i64;
    let mut prev_lng = 0_i64;

    for point in points {
        #[allow(clippy::cast_possible_truncation)]
        let lat = (point.lat * FACTOR).round() as i64;
        #[allow(clippy::cast_possible_truncation)]
        let lng = (point.lng * FACTOR).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

fn encode_value(delta: i64, out: &mut String) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= 0x20 {
        let chunk = (0x20 | (value & 0x1f)) + 63;
        out.push(char::from(u8::try_from(chunk).unwrap_or(b'?')));
        value >>= 5;
    }
    out.push(char::from(u8::try_from(value + 63).unwrap_or(b'?')));
}

/// Decodes an encoded polyline.
///
/// # Errors
///
/// Returns [`InvalidPolylineError`] if the input is truncated or contains
/// bytes outside the encoding alphabet.
pub fn decode(encoded: &str) -> Result<Vec<Coordinates>, InvalidPolylineError> {
    let bytes = encoded.as_bytes();
    let mut index = 0;
    let mut lat = 0_i64;
    let mut lng = 0_i64;
    let mut points = Vec::new();

    while index < bytes.len() {
        lat += decode_value(bytes, &mut index)?;
        lng += decode_value(bytes, &mut index)?;
        #[allow(clippy::cast_precision_loss)]
        points.push(Coordinates {
            lat: lat as f64 / FACTOR,
            lng: lng as f64 / FACTOR,
        });
    }

    Ok(points)
}

fn decode_value(bytes: &[u8], index: &mut usize) -> Result<i64, InvalidPolylineError> {
    let mut result = 0_i64;
    let mut shift = 0;

    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(InvalidPolylineError { position: *index });
        };
        if !(63..127).contains(&byte) || shift > 60 {
            return Err(InvalidPolylineError { position: *index });
        }
        *index += 1;

        let chunk = i64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;

        if chunk < 0x20 {
            break;
        }
    }

    Ok(if result & 1 == 1 {
        !(result >> 1)
    } else {
        result >> 1
    })
}
