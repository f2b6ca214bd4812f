//! Google Maps Platform adapter (Directions and Geocoding APIs).
//!
//! See <https://developers.google.com/maps/documentation/directions/get-directions>
//! and <https://developers.google.com/maps/documentation/geocoding/requests-geocoding>.
//! Google reports most failures in a `status` field of a 200 response, so
//! those are classified by [`check_status`] rather than by HTTP status.

use async_trait::async_trait;
use chrono::Utc;
use safewalk_risk_models::Coordinates;
use safewalk_routing_models::{
    Address, MAX_GEOCODE_RESULTS, Route, RouteOptions, TrafficData, TravelMode,
};
use serde_json::Value;

use super::{missing_key, not_found, opt_string, require_f64, send_json, strip_html};
use crate::{ErrorCode, MapAdapter, ProviderError};

const NAME: &str = "google";

/// Google Directions + Geocoding client.
#[derive(Debug, Clone)]
pub struct GoogleMapsAdapter {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl GoogleMapsAdapter {
    /// Creates the adapter. An empty key counts as missing.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        }
    }

    fn key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or_else(|| missing_key(NAME))
    }

    async fn get(
        &self,
        endpoint: &str,
        mut params: Vec<(&str, String)>,
    ) -> Result<Value, ProviderError> {
        params.push(("key", self.key()?.to_string()));
        let url = format!("{}/{endpoint}/json", self.base_url);
        let body = send_json(NAME, self.client.get(&url).query(&params)).await?;
        check_status(&body)?;
        Ok(body)
    }

    async fn directions(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
        alternatives: bool,
    ) -> Result<Vec<Route>, ProviderError> {
        let mut params = vec![
            ("origin", origin.to_string()),
            ("destination", destination.to_string()),
            ("mode", mode_param(options.mode).to_string()),
            ("alternatives", alternatives.to_string()),
        ];
        if let Some(avoid) = avoid_param(options) {
            params.push(("avoid", avoid));
        }
        if let Some(language) = &options.language {
            params.push(("language", language.clone()));
        }

        let body = self.get("directions", params).await?;
        parse_routes(&body)
    }
}

const fn mode_param(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Walking => "walking",
        TravelMode::Cycling => "bicycling",
        TravelMode::Driving => "driving",
    }
}

fn avoid_param(options: &RouteOptions) -> Option<String> {
    let mut avoid = Vec::new();
    if options.avoid_highways {
        avoid.push("highways");
    }
    if options.avoid_tolls {
        avoid.push("tolls");
    }
    (!avoid.is_empty()).then(|| avoid.join("|"))
}

#[async_trait]
impl MapAdapter for GoogleMapsAdapter {
    fn provider_name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some() && !self.base_url.is_empty()
    }

    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError> {
        self.directions(origin, destination, options, false)
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
            .directions(origin, destination, options, count > 1)
            .await?;
        routes.truncate(count);
        Ok(routes)
    }

    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError> {
        let body = match self.get("geocode", vec![("address", address.to_string())]).await {
            Err(e) if e.code == ErrorCode::NotFound => return Ok(Vec::new()),
            other => other?,
        };
        let mut addresses = parse_addresses(&body)?;
        addresses.truncate(MAX_GEOCODE_RESULTS);
        Ok(addresses)
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError> {
        let body = self
            .get("geocode", vec![("latlng", coordinates.to_string())])
            .await?;
        parse_addresses(&body)?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(NAME, "address"))
    }

    async fn traffic_data(&self, route: &Route) -> Result<TrafficData, ProviderError> {
        let (origin, destination) = route.endpoints().ok_or_else(|| {
            ProviderError::invalid_request(NAME, "route has no decodable geometry")
        })?;
        let params = vec![
            ("origin", origin.to_string()),
            ("destination", destination.to_string()),
            ("mode", "driving".to_string()),
            ("departure_time", "now".to_string()),
        ];
        let body = self.get("directions", params).await?;
        parse_traffic(&body)
    }
}

/// Maps Google's `status` field to an error.
fn check_status(body: &Value) -> Result<(), ProviderError> {
    let status = body["status"].as_str().unwrap_or("OK");
    let detail = body["error_message"].as_str().unwrap_or(status);
    let code = match status {
        "OK" => return Ok(()),
        "ZERO_RESULTS" | "NOT_FOUND" => ErrorCode::NotFound,
        "OVER_QUERY_LIMIT" | "OVER_DAILY_LIMIT" => ErrorCode::RateLimited,
        "REQUEST_DENIED" => ErrorCode::Unauthorized,
        "INVALID_REQUEST" | "MAX_WAYPOINTS_EXCEEDED" | "MAX_ROUTE_LENGTH_EXCEEDED" => {
            ErrorCode::InvalidRequest
        }
        "UNKNOWN_ERROR" => ErrorCode::ServerError,
        _ => ErrorCode::InvalidResponse,
    };
    Err(ProviderError::new(NAME, code, format!("{status}: {detail}")))
}

fn parse_routes(body: &Value) -> Result<Vec<Route>, ProviderError> {
    let routes = body["routes"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no routes array"))?;
    routes.iter().map(parse_route).collect()
}

fn parse_route(route: &Value) -> Result<Route, ProviderError> {
    let polyline = route["overview_polyline"]["points"]
        .as_str()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "route has no overview polyline"))?;

    let mut distance_m = 0.0;
    let mut duration_s = 0.0;
    let mut instructions = Vec::new();

    for leg in route["legs"].as_array().into_iter().flatten() {
        distance_m += require_f64(NAME, &leg["distance"], "value")?;
        duration_s += require_f64(NAME, &leg["duration"], "value")?;
        for step in leg["steps"].as_array().into_iter().flatten() {
            if let Some(html) = step["html_instructions"].as_str() {
                instructions.push(strip_html(html));
            }
        }
    }

    Ok(Route::new(NAME, distance_m, duration_s, polyline.to_string(), instructions))
}

fn parse_traffic(body: &Value) -> Result<TrafficData, ProviderError> {
    let route = body["routes"]
        .get(0)
        .ok_or_else(|| not_found(NAME, "route"))?;

    let mut typical = 0.0;
    let mut in_traffic = 0.0;
    for leg in route["legs"].as_array().into_iter().flatten() {
        let duration = require_f64(NAME, &leg["duration"], "value")?;
        typical += duration;
        in_traffic += leg["duration_in_traffic"]["value"].as_f64().unwrap_or(duration);
    }

    Ok(TrafficData::from_durations(NAME, typical, in_traffic, Utc::now()))
}

fn parse_addresses(body: &Value) -> Result<Vec<Address>, ProviderError> {
    let results = body["results"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no results array"))?;
    results.iter().map(parse_address).collect()
}

fn parse_address(result: &Value) -> Result<Address, ProviderError> {
    let location = &result["geometry"]["location"];
    let coordinates = Coordinates {
        lat: require_f64(NAME, location, "lat")?,
        lng: require_f64(NAME, location, "lng")?,
    };

    let mut street_number = None;
    let mut route = None;
    let mut city = None;
    let mut state = None;
    let mut postal_code = None;
    let mut country = None;

    for component in result["address_components"].as_array().into_iter().flatten() {
        let types: Vec<&str> = component["types"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .collect();
        let long_name = opt_string(&component["long_name"]);
        let short_name = opt_string(&component["short_name"]);

        if types.contains(&"street_number") {
            street_number = long_name;
        } else if types.contains(&"route") {
            route = long_name;
        } else if types.contains(&"locality") {
            city = long_name;
        } else if types.contains(&"administrative_area_level_1") {
            state = short_name.or(long_name);
        } else if types.contains(&"postal_code") {
            postal_code = long_name;
        } else if types.contains(&"country") {
            country = long_name;
        }
    }

    let street = match (route, street_number) {
        (Some(route), Some(number)) => Some(format!("{route}, {number}")),
        (route, _) => route,
    };

    Ok(Address {
        formatted_address: opt_string(&result["formatted_address"]).unwrap_or_default(),
        coordinates,
        street,
        city,
        state,
        postal_code,
        country,
        provider: NAME.to_string(),
    })
}
