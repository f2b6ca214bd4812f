//! Mapbox adapter (Directions v5, Geocoding v5).
//!
//! Geometry is requested as `polyline` (precision 5), which is already the
//! neutral format. Traffic uses the `driving-traffic` profile and compares
//! `duration` against `duration_typical`.

use async_trait::async_trait;
use chrono::Utc;
use safewalk_risk_models::Coordinates;
use safewalk_routing_models::{
    Address, MAX_GEOCODE_RESULTS, Route, RouteOptions, TrafficData, TravelMode,
};
use serde_json::Value;

use super::{missing_key, not_found, opt_string, require_f64, send_json};
use crate::{ErrorCode, MapAdapter, ProviderError};

const NAME: &str = "mapbox";

/// Mapbox Directions + Geocoding client.
#[derive(Debug, Clone)]
pub struct MapboxAdapter {
    client: reqwest::Client,
    base_url: String,
    access_token: Option<String>,
}

impl MapboxAdapter {
    /// Creates the adapter. An empty token counts as missing.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        access_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.filter(|k| !k.trim().is_empty()),
        }
    }

    fn token(&self) -> Result<&str, ProviderError> {
        self.access_token.as_deref().ok_or_else(|| missing_key(NAME))
    }

    /// Builds `{base}/{segments...}` with each segment percent-encoded.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, ProviderError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| ProviderError::invalid_request(NAME, format!("bad base URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ProviderError::invalid_request(NAME, "base URL cannot have a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn directions(
        &self,
        profile: &str,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
        alternatives: bool,
    ) -> Result<Vec<Route>, ProviderError> {
        let waypoints = format!(
            "{},{};{},{}",
            origin.lng, origin.lat, destination.lng, destination.lat
        );
        let url = self.url(&["directions", "v5", "mapbox", profile, &waypoints])?;

        let mut params = vec![
            ("alternatives", alternatives.to_string()),
            ("geometries", "polyline".to_string()),
            ("overview", "full".to_string()),
            ("steps", "true".to_string()),
            ("access_token", self.token()?.to_string()),
        ];
        if let Some(exclude) = exclude_param(options) {
            params.push(("exclude", exclude));
        }
        if let Some(language) = &options.language {
            params.push(("language", language.clone()));
        }

        let body = send_json(NAME, self.client.get(url).query(&params)).await?;
        check_code(&body)?;
        parse_routes(&body)
    }

    async fn places(&self, query: &str, limit: usize) -> Result<Vec<Address>, ProviderError> {
        let url = self.url(&["geocoding", "v5", "mapbox.places", &format!("{query}.json")])?;
        let params = [
            ("limit", limit.to_string()),
            ("access_token", self.token()?.to_string()),
        ];
        let body = send_json(NAME, self.client.get(url).query(&params)).await?;
        parse_features(&body)
    }
}

const fn profile(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Walking => "walking",
        TravelMode::Cycling => "cycling",
        TravelMode::Driving => "driving",
    }
}

fn exclude_param(options: &RouteOptions) -> Option<String> {
    if options.mode != TravelMode::Driving {
        return None;
    }
    let mut exclude = Vec::new();
    if options.avoid_highways {
        exclude.push("motorway");
    }
    if options.avoid_tolls {
        exclude.push("toll");
    }
    (!exclude.is_empty()).then(|| exclude.join(","))
}

#[async_trait]
impl MapAdapter for MapboxAdapter {
    fn provider_name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        self.access_token.is_some() && !self.base_url.is_empty()
    }

    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError> {
        self.directions(profile(options.mode), origin, destination, options, false)
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
            .directions(profile(options.mode), origin, destination, options, count > 1)
            .await?;
        routes.truncate(count);
        Ok(routes)
    }

    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError> {
        let mut addresses = self.places(address, MAX_GEOCODE_RESULTS).await?;
        addresses.truncate(MAX_GEOCODE_RESULTS);
        Ok(addresses)
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError> {
        let query = format!("{},{}", coordinates.lng, coordinates.lat);
        self.places(&query, 1)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| not_found(NAME, "address"))
    }

    async fn traffic_data(&self, route: &Route) -> Result<TrafficData, ProviderError> {
        let (origin, destination) = route.endpoints().ok_or_else(|| {
            ProviderError::invalid_request(NAME, "route has no decodable geometry")
        })?;
        let url = self.url(&[
            "directions",
            "v5",
            "mapbox",
            "driving-traffic",
            &format!(
                "{},{};{},{}",
                origin.lng, origin.lat, destination.lng, destination.lat
            ),
        ])?;
        let params = [
            ("overview", "false".to_string()),
            ("access_token", self.token()?.to_string()),
        ];
        let body = send_json(NAME, self.client.get(url).query(&params)).await?;
        check_code(&body)?;
        parse_traffic(&body)
    }
}

/// Maps the Directions `code` field to an error.
fn check_code(body: &Value) -> Result<(), ProviderError> {
    let code = body["code"].as_str().unwrap_or("Ok");
    let message = body["message"].as_str().unwrap_or(code);
    let error_code = match code {
        "Ok" => return Ok(()),
        "NoRoute" | "NoSegment" => ErrorCode::NotFound,
        "InvalidInput" | "ProfileNotFound" => ErrorCode::InvalidRequest,
        _ => ErrorCode::InvalidResponse,
    };
    Err(ProviderError::new(NAME, error_code, format!("{code}: {message}")))
}

fn parse_routes(body: &Value) -> Result<Vec<Route>, ProviderError> {
    let routes = body["routes"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no routes array"))?;

    routes
        .iter()
        .map(|route| -> Result<Route, ProviderError> {
            let polyline = route["geometry"]
                .as_str()
                .ok_or_else(|| ProviderError::invalid_response(NAME, "route has no geometry"))?;
            let instructions = route["legs"]
                .as_array()
                .into_iter()
                .flatten()
                .flat_map(|leg| leg["steps"].as_array().into_iter().flatten())
                .filter_map(|step| opt_string(&step["maneuver"]["instruction"]))
                .collect();
            Ok(Route::new(
                NAME,
                require_f64(NAME, route, "distance")?,
                require_f64(NAME, route, "duration")?,
                polyline.to_string(),
                instructions,
            ))
        })
        .collect()
}

fn parse_traffic(body: &Value) -> Result<TrafficData, ProviderError> {
    let route = body["routes"]
        .get(0)
        .ok_or_else(|| not_found(NAME, "route"))?;
    let in_traffic = require_f64(NAME, route, "duration")?;
    let typical = route["duration_typical"].as_f64().unwrap_or(in_traffic);
    Ok(TrafficData::from_durations(NAME, typical, in_traffic, Utc::now()))
}

fn parse_features(body: &Value) -> Result<Vec<Address>, ProviderError> {
    let features = body["features"]
        .as_array()
        .ok_or_else(|| ProviderError::invalid_response(NAME, "response has no features array"))?;

    features
        .iter()
        .map(|feature| -> Result<Address, ProviderError> {
            let center = &feature["center"];
            let coordinates = Coordinates {
                lng: center[0].as_f64().ok_or_else(|| {
                    ProviderError::invalid_response(NAME, "feature has no center")
                })?,
                lat: center[1].as_f64().ok_or_else(|| {
                    ProviderError::invalid_response(NAME, "feature has no center")
                })?,
            };

            let is_address = feature["place_type"]
                .as_array()
                .is_some_and(|types| types.iter().any(|t| t.as_str() == Some("address")));
            let street = is_address
                .then(|| opt_string(&feature["text"]))
                .flatten()
                .map(|street| match opt_string(&feature["address"]) {
                    Some(number) => format!("{street}, {number}"),
                    None => street,
                });

            let mut city = None;
            let mut state = None;
            let mut postal_code = None;
            let mut country = None;
            for context in feature["context"].as_array().into_iter().flatten() {
                let id = context["id"].as_str().unwrap_or_default();
                let text = opt_string(&context["text"]);
                match id.split('.').next().unwrap_or_default() {
                    "place" => city = text,
                    "region" => state = text,
                    "postcode" => postal_code = text,
                    "country" => country = text,
                    _ => {}
                }
            }

            Ok(Address {
                formatted_address: opt_string(&feature["place_name"]).unwrap_or_default(),
                coordinates,
                street,
                city,
                state,
                postal_code,
                country,
                provider: NAME.to_string(),
            })
        })
        .collect()
}
