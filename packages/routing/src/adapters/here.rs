//! HERE adapter (Routing v8, Geocoding & Search v7).
//!
//! HERE encodes geometry as a "flexible polyline" with a version/precision
//! header and a different alphabet. Sections are decoded with
//! [`decode_flexible`] and re-encoded as a Google polyline so every
//! adapter returns the same geometry format.
//!
//! See <https://github.com/heremaps/flexible-polyline>.

use async_trait::async_trait;
use chrono::Utc;
use safewalk_risk_models::Coordinates;
use safewalk_routing_models::{
    Address, MAX_GEOCODE_RESULTS, Route, RouteOptions, TrafficData, TravelMode, polyline,
};
use serde_json::Value;

use super::{missing_key, not_found, opt_string, require_f64, send_json};
use crate::{MapAdapter, ProviderError};

const NAME: &str = "here";

const ALPHABET: &[u8; 64] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// Flexible polyline format version this decoder understands.
const FORMAT_VERSION: u64 = 1;

/// HERE Routing + Geocoding client.
#[derive(Debug, Clone)]
pub struct HereAdapter {
    client: reqwest::Client,
    routing_base_url: String,
    geocoding_base_url: String,
    reverse_geocoding_base_url: String,
    api_key: Option<String>,
}

impl HereAdapter {
    /// Creates the adapter. An empty key counts as missing.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        routing_base_url: impl Into<String>,
        geocoding_base_url: impl Into<String>,
        reverse_geocoding_base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        let trim = |url: String| url.trim_end_matches('/').to_string();
        Self {
            client,
            routing_base_url: trim(routing_base_url.into()),
            geocoding_base_url: trim(geocoding_base_url.into()),
            reverse_geocoding_base_url: trim(reverse_geocoding_base_url.into()),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| missing_key(NAME))
    }

    async fn routes(&self, mut params: Vec<(&str, String)>) -> Result<Value, ProviderError> {
        params.push(("apiKey", self.key()?.to_string()));
        let url = format!("{}/v8/routes", self.routing_base_url);
        send_json(NAME, self.client.get(&url).query(&params)).await
    }

    async fn fetch_routes(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
        alternatives: usize,
    ) -> Result<Vec<Route>, ProviderError> {
        let mut params = vec![
            ("transportMode", transport_mode(options.mode).to_string()),
            ("origin", origin.to_string()),
            ("destination", destination.to_string()),
            ("return", "polyline,summary,actions,instructions".to_string()),
        ];
        if alternatives > 0 {
            params.push(("alternatives", alternatives.to_string()));
        }
        if let Some(avoid) = avoid_features(options) {
            params.push(("avoid[features]", avoid));
        }
        if let Some(language) = &options.language {
            params.push(("lang", language.clone()));
        }

        let body = self.routes(params).await?;
        parse_routes(&body)
    }
}

const fn transport_mode(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Walking => "pedestrian",
        TravelMode::Cycling => "bicycle",
        TravelMode::Driving => "car",
    }
}

fn avoid_features(options: &RouteOptions) -> Option<String> {
    let mut avoid = Vec::new();
    if options.avoid_highways {
        avoid.push("controlledAccessHighway");
    }
    if options.avoid_tolls {
        avoid.push("tollRoad");
    }
    (!avoid.is_empty()).then(|| avoid.join(","))
}

#[async_trait]
impl MapAdapter for HereAdapter {
    fn provider_name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && !self.routing_base_url.is_empty()
    }

    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError> {
        self.fetch_routes(origin, destination, options, 0)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(NAME, "route"))
    }

    async fn calculate_alternative_routes_with(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        count: usize,
        options: &RouteOptions,
    ) -> Result<Vec<Route>, ProviderError> {
        let mut routes = self
            .fetch_routes(origin, destination, options, count.saturating_sub(1))
            .await?;
        routes.truncate(count);
        Ok(routes)
    }

    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError> {
        let url = format!("{}/v1/geocode", self.geocoding_base_url);
        let params = [
            ("q", address.to_string()),
            ("limit", MAX_GEOCODE_RESULTS.to_string()),
            ("apiKey", self.key()?.to_string()),
        ];
        let body = send_json(NAME, self.client.get(&url).query(&params)).await?;
        let mut addresses = parse_items(&body)?;
        addresses.truncate(MAX_GEOCODE_RESULTS);
        Ok(addresses)
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError> {
        let url = format!("{}/v1/revgeocode", self.reverse_geocoding_base_url);
        let params = [
            ("at", coordinates.to_string()),
            ("limit", "1".to_string()),
            ("apiKey", self.key()?.to_string()),
        ];
        let body = send_json(NAME, self.client.get(&url).query(&params)).await?;
        parse_items(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(NAME, "address"))
    }

    async fn traffic_data(&self, route: &Route) -> Result<TrafficData, ProviderError> {
        let (origin, destination) = route.endpoints().ok_or_else(|| {
            ProviderError::invalid_request(NAME, "route has no decodable geometry")
        })?;
        let params = vec![
            ("transportMode", "car".to_string()),
            ("origin", origin.to_string()),
            ("destination", destination.to_string()),
            ("return", "summary".to_string()),
        ];
        let body = self.routes(params).await?;
        parse_traffic(&body)
    }
}

fn parse_routes(body: &Value) -> Result<Vec<Route>, ProviderError> {
    let routes = body["routes"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no routes array"))?;
    if routes.is_empty() {
        let notice = body["notices"][0]["title"].as_str().unwrap_or("no route found");
        return Err(ProviderError::new(NAME, crate::ErrorCode::NotFound, notice));
    }
    routes.iter().map(parse_route).collect()
}

fn parse_route(route: &Value) -> Result<Route, ProviderError> {
    let mut distance_m = 0.0;
    let mut duration_s = 0.0;
    let mut points: Vec<Coordinates> = Vec::new();
    let mut instructions = Vec::new();

    for section in route["sections"].as_array().into_iter().flatten() {
        distance_m += require_f64(NAME, &section["summary"], "length")?;
        duration_s += require_f64(NAME, &section["summary"], "duration")?;

        let encoded = section["polyline"]
            .as_str()
            .ok_or_else(|| ProviderError::invalid_response(NAME, "section has no polyline"))?;
        let decoded = decode_flexible(encoded).map_err(|e| {
            ProviderError::invalid_response(NAME, format!("undecodable section polyline: {e}"))
        })?;
        // Consecutive sections share their joint vertex.
        let skip = usize::from(points.last().is_some() && points.last() == decoded.first());
        points.extend(decoded.into_iter().skip(skip));

        for action in section["actions"].as_array().into_iter().flatten() {
            if let Some(instruction) = opt_string(&action["instruction"]) {
                instructions.push(instruction);
            }
        }
    }

    Ok(Route::new(
        NAME,
        distance_m,
        duration_s,
        polyline::encode(&points),
        instructions,
    ))
}

fn parse_traffic(body: &Value) -> Result<TrafficData, ProviderError> {
    let sections = body["routes"][0]["sections"]
        .as_array()
        .ok_or_else(|| not_found(NAME, "route"))?;

    let mut typical = 0.0;
    let mut in_traffic = 0.0;
    for section in sections {
        let duration = require_f64(NAME, &section["summary"], "duration")?;
        in_traffic += duration;
        typical += section["summary"]["baseDuration"].as_f64().unwrap_or(duration);
    }

    Ok(TrafficData::from_durations(NAME, typical, in_traffic, Utc::now()))
}

fn parse_items(body: &Value) -> Result<Vec<Address>, ProviderError> {
    let items = body["items"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no items array"))?;

    items
        .iter()
        .map(|item| -> Result<Address, ProviderError> {
            let position = &item["position"];
            let address = &item["address"];
            let street = match (
                opt_string(&address["street"]),
                opt_string(&address["houseNumber"]),
            ) {
                (Some(street), Some(number)) => Some(format!("{street}, {number}")),
                (street, _) => street,
            };
            Ok(Address {
                formatted_address: opt_string(&address["label"])
                    .or_else(|| opt_string(&item["title"]))
                    .unwrap_or_default(),
                coordinates: Coordinates {
                    lat: require_f64(NAME, position, "lat")?,
                    lng: require_f64(NAME, position, "lng")?,
                },
                street,
                city: opt_string(&address["city"]),
                state: opt_string(&address["stateCode"]).or_else(|| opt_string(&address["state"])),
                postal_code: opt_string(&address["postalCode"]),
                country: opt_string(&address["countryName"]),
                provider: NAME.to_string(),
            })
        })
        .collect()
}

/// Error from [`decode_flexible`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlexiblePolylineError {
    /// A character outside the encoding alphabet.
    #[error("invalid character {0:?}")]
    InvalidChar(char),
    /// The input ended inside a value or a coordinate tuple.
    #[error("truncated input")]
    Truncated,
    /// The header names an unknown format version.
    #[error("unsupported format version {0}")]
    Version(u64),
}

/// Decodes a HERE flexible polyline into 2D coordinates. A third
/// dimension, if present, is dropped.
///
/// # Errors
///
/// Returns [`FlexiblePolylineError`] if the input is malformed.
pub fn decode_flexible(encoded: &str) -> Result<Vec<Coordinates>, FlexiblePolylineError> {
    let values = decode_unsigned_values(encoded)?;
    let mut values = values.into_iter();

    let version = values.next().ok_or(FlexiblePolylineError::Truncated)?;
    if version != FORMAT_VERSION {
        return Err(FlexiblePolylineError::Version(version));
    }
    let header = values.next().ok_or(FlexiblePolylineError::Truncated)?;
    let precision = i32::try_from(header & 0x0f).unwrap_or(0);
    let has_third_dim = (header >> 4) & 0x07 != 0;
    let factor = 10_f64.powi(precision);

    let values: Vec<i64> = values.map(zigzag).collect();
    let stride = if has_third_dim { 3 } else { 2 };
    if values.len() % stride != 0 {
        return Err(FlexiblePolylineError::Truncated);
    }

    let mut lat = 0_i64;
    let mut lng = 0_i64;
    let mut points = Vec::with_capacity(values.len() / stride);
    for tuple in values.chunks(stride) {
        lat += tuple[0];
        lng += tuple[1];
        #[allow(clippy::cast_precision_loss)]
        points.push(Coordinates {
            lat: lat as f64 / factor,
            lng: lng as f64 / factor,
        });
    }

    Ok(points)
}

fn decode_unsigned_values(encoded: &str) -> Result<Vec<u64>, FlexiblePolylineError> {
    let mut values = Vec::new();
    let mut current = 0_u64;
    let mut shift = 0_u32;

    for c in encoded.chars() {
        let chunk = u8::try_from(c)
            .ok()
            .and_then(|b| ALPHABET.iter().position(|&a| a == b))
            .ok_or(FlexiblePolylineError::InvalidChar(c))? as u64;
        if shift > 60 {
            return Err(FlexiblePolylineError::InvalidChar(c));
        }
        current |= (chunk & 0x1f) << shift;
        if chunk & 0x20 == 0 {
            values.push(current);
            current = 0;
            shift = 0;
        } else {
            shift += 5;
        }
    }

    if shift != 0 {
        return Err(FlexiblePolylineError::Truncated);
    }
    Ok(values)
}

#[allow(clippy::cast_possible_wrap)]
const fn zigzag(value: u64) -> i64 {
    let half = (value >> 1) as i64;
    if value & 1 == 1 { !half } else { half }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE: &str = "BFoz5xJ67i1B1B7PzIhaxL7Y";

    #[test]
    fn decodes_reference_flexible_polyline() {
        let points = decode_flexible(REFERENCE).unwrap();
        let expected = [
            (50.10228, 8.69821),
            (50.10201, 8.69567),
            (50.10063, 8.69150),
            (50.09878, 8.68752),
        ];
        assert_eq!(points.len(), expected.len());
        for (got, (lat, lng)) in points.iter().zip(expected) {
            assert!((got.lat - lat).abs() < 1e-9, "{got:?}");
            assert!((got.lng - lng).abs() < 1e-9, "{got:?}");
        }
    }

    #[test]
    fn rejects_malformed_flexible_polyline() {
        assert_eq!(decode_flexible(""), Err(FlexiblePolylineError::Truncated));
        assert_eq!(decode_flexible("CF"), Err(FlexiblePolylineError::Version(2)));
        assert!(matches!(decode_flexible("BF!!"), Err(FlexiblePolylineError::InvalidChar('!'))));
        // Header plus a lone latitude.
        assert_eq!(decode_flexible("BFoz5xJ"), Err(FlexiblePolylineError::Truncated));
    }

    #[test]
    fn routes_are_reencoded_as_google_polylines() {
        let body = serde_json::json!({
            "routes": [{
                "sections": [{
                    "summary": { "length": 850, "duration": 640, "baseDuration": 600 },
                    "polyline": REFERENCE,
                    "actions": [
                        { "action": "depart", "instruction": "Head toward Kaiserstraße." },
                        { "action": "arrive", "instruction": "Arrive at your destination." }
                    ]
                }]
            }]
        });
        let routes = parse_routes(&body).unwrap();
        assert_eq!(routes.len(), 1);
        let route = &routes[0];
        assert_eq!(route.provider, "here");
        assert!((route.distance_m - 850.0).abs() < f64::EPSILON);
        assert_eq!(route.instructions.len(), 2);

        let geometry = route.geometry();
        assert_eq!(geometry.len(), 4);
        assert!((geometry[3].lat - 50.09878).abs() < 1e-5);
        assert!((geometry[3].lng - 8.68752).abs() < 1e-5);

        let traffic = parse_traffic(&body).unwrap();
        assert!((traffic.delay_s - 40.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_routes_is_not_found() {
        let body = serde_json::json!({ "routes": [], "notices": [{ "title": "Route calculation failed", "code": "couldNotMatchOrigin" }] });
        let err = parse_routes(&body).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::NotFound);
        assert!(!err.retryable);
    }

    #[test]
    fn parses_geocode_items() {
        let body = serde_json::json!({
            "items": [{
                "title": "Kaiserstraße 1, 60311 Frankfurt am Main, Deutschland",
                "position": { "lat": 50.11158, "lng": 8.67513 },
                "address": {
                    "label": "Kaiserstraße 1, 60311 Frankfurt am Main, Deutschland",
                    "countryName": "Deutschland",
                    "state": "Hessen",
                    "city": "Frankfurt am Main",
                    "street": "Kaiserstraße",
                    "postalCode": "60311",
                    "houseNumber": "1"
                }
            }]
        });
        let addresses = parse_items(&body).unwrap();
        assert_eq!(addresses[0].street.as_deref(), Some("Kaiserstraße, 1"));
        assert_eq!(addresses[0].state.as_deref(), Some("Hessen"));
        assert_eq!(addresses[0].city.as_deref(), Some("Frankfurt am Main"));
    }
}
