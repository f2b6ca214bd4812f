//! `OpenStreetMap` adapter: Nominatim for geocoding, OSRM for routing.
//!
//! Needs no credentials, so it is the last resort of the fallback chain.
//! Nominatim allows at most one request per second on the public
//! instance; the provider's quota in `services/osm.toml` enforces that.
//! OSRM has no live traffic, so [`MapAdapter::traffic_data`] fails with a
//! non-retryable [`ErrorCode::Unsupported`].
//!
//! See <https://nominatim.org/release-docs/develop/api/Search/> and
//! <https://project-osrm.org/docs/v5.24.0/api/#route-service>.

use async_trait::async_trait;
use safewalk_risk_models::Coordinates;
use safewalk_routing_models::{
    Address, MAX_GEOCODE_RESULTS, Route, RouteOptions, TrafficData, TravelMode,
};
use serde_json::Value;

use super::{not_found, opt_string, require_f64, send_json};
use crate::{ErrorCode, MapAdapter, ProviderError};

const NAME: &str = "osm";

/// Nominatim + OSRM client.
#[derive(Debug, Clone)]
pub struct OsmAdapter {
    client: reqwest::Client,
    nominatim_base_url: String,
    osrm_base_url: String,
}

impl OsmAdapter {
    /// Creates the adapter. The client should carry an identifying
    /// `User-Agent`, which Nominatim requires.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        nominatim_base_url: impl Into<String>,
        osrm_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            nominatim_base_url: nominatim_base_url.into().trim_end_matches('/').to_string(),
            osrm_base_url: osrm_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
        alternatives: bool,
    ) -> Result<Vec<Route>, ProviderError> {
        let url = format!(
            "{}/route/v1/{}/{},{};{},{}",
            self.osrm_base_url,
            osrm_profile(options.mode),
            origin.lng,
            origin.lat,
            destination.lng,
            destination.lat
        );
        let params = [
            ("overview", "full"),
            ("geometries", "polyline"),
            ("steps", "true"),
            ("alternatives", if alternatives { "true" } else { "false" }),
        ];
        let mut request = self.client.get(&url).query(&params);
        if let Some(exclude) = exclude_param(options) {
            request = request.query(&[("exclude", exclude)]);
        }
        let body = send_json(NAME, request).await?;
        check_code(&body)?;
        parse_routes(&body)
    }
}

const fn osrm_profile(mode: TravelMode) -> &'static str {
    match mode {
        TravelMode::Walking => "foot",
        TravelMode::Cycling => "bike",
        TravelMode::Driving => "car",
    }
}

/// OSRM exclude classes. Only the car profile defines `motorway` and
/// `toll`; the foot and bike profiles reject any exclude.
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
impl MapAdapter for OsmAdapter {
    fn provider_name(&self) -> &str {
        NAME
    }

    fn is_available(&self) -> bool {
        !self.nominatim_base_url.is_empty() && !self.osrm_base_url.is_empty()
    }

    async fn calculate_route(
        &self,
        origin: Coordinates,
        destination: Coordinates,
        options: &RouteOptions,
    ) -> Result<Route, ProviderError> {
        self.route(origin, destination, options, false)
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
            .route(origin, destination, options, count > 1)
            .await?;
        routes.truncate(count);
        Ok(routes)
    }

    async fn geocode(&self, address: &str) -> Result<Vec<Address>, ProviderError> {
        let url = format!("{}/search", self.nominatim_base_url);
        let limit = MAX_GEOCODE_RESULTS.to_string();
        let params = [
            ("q", address),
            ("format", "jsonv2"),
            ("addressdetails", "1"),
            ("limit", limit.as_str()),
        ];
        let body = send_json(NAME, self.client.get(&url).query(&params)).await?;
        let results = body.as_array().ok_or_else(|| {
            ProviderError::invalid_response(NAME, "Nominatim response is not an array")
        })?;
        results
            .iter()
            .take(MAX_GEOCODE_RESULTS)
            .map(parse_place)
            .collect()
    }

    async fn reverse_geocode(&self, coordinates: Coordinates) -> Result<Address, ProviderError> {
        let url = format!("{}/reverse", self.nominatim_base_url);
        let lat = coordinates.lat.to_string();
        let lon = coordinates.lng.to_string();
        let params = [
            ("lat", lat.as_str()),
            ("lon", lon.as_str()),
            ("format", "jsonv2"),
            ("addressdetails", "1"),
        ];
        let body = send_json(NAME, self.client.get(&url).query(&params)).await?;
        if let Some(error) = body["error"].as_str() {
            return Err(ProviderError::new(NAME, ErrorCode::NotFound, error));
        }
        parse_place(&body)
    }

    async fn traffic_data(&self, _route: &Route) -> Result<TrafficData, ProviderError> {
        Err(ProviderError::new(
            NAME,
            ErrorCode::Unsupported,
            "OSRM does not provide live traffic data",
        ))
    }
}

fn check_code(body: &Value) -> Result<(), ProviderError> {
    let code = body["code"].as_str().unwrap_or("Ok");
    let message = body["message"].as_str().unwrap_or(code);
    let error_code = match code {
        "Ok" => return Ok(()),
        "NoRoute" | "NoSegment" => ErrorCode::NotFound,
        "InvalidUrl" | "InvalidService" | "InvalidVersion" | "InvalidOptions" | "InvalidQuery"
        | "InvalidValue" | "TooBig" => ErrorCode::InvalidRequest,
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
                .map(describe_step)
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

/// OSRM has no text instructions; builds one from the maneuver.
fn describe_step(step: &Value) -> String {
    let kind = step["maneuver"]["type"].as_str().unwrap_or("continue");
    let modifier = step["maneuver"]["modifier"].as_str();
    let name = step["name"].as_str().filter(|n| !n.is_empty());

    let mut text = match (kind, modifier) {
        ("depart", _) => "Depart".to_string(),
        ("arrive", _) => "Arrive at destination".to_string(),
        (kind, Some(modifier)) => format!("{} {modifier}", capitalize(kind)),
        (kind, None) => capitalize(kind),
    };
    if let (Some(name), false) = (name, kind == "arrive") {
        text.push_str(" onto ");
        text.push_str(name);
    }
    text
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}

fn parse_place(place: &Value) -> Result<Address, ProviderError> {
    let lat = place["lat"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| ProviderError::invalid_response(NAME, "Missing lat in Nominatim response"))?;
    let lng = place["lon"]
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| ProviderError::invalid_response(NAME, "Missing lon in Nominatim response"))?;

    let address = &place["address"];
    let street = match (opt_string(&address["road"]), opt_string(&address["house_number"])) {
        (Some(road), Some(number)) => Some(format!("{road}, {number}")),
        (road, _) => road,
    };
    let city = opt_string(&address["city"])
        .or_else(|| opt_string(&address["town"]))
        .or_else(|| opt_string(&address["village"]));

    Ok(Address {
        formatted_address: opt_string(&place["display_name"]).unwrap_or_default(),
        coordinates: Coordinates { lat, lng },
        street,
        city,
        state: opt_string(&address["state"]),
        postal_code: opt_string(&address["postcode"]),
        country: opt_string(&address["country"]),
        provider: NAME.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_osrm_route() {
        let body = serde_json::json!({
            "code": "Ok",
            "routes": [{
                "distance": 987.6,
                "duration": 702.1,
                "geometry": "_p~iF~ps|U_ulLnnqC",
                "legs": [{
                    "steps": [
                        { "name": "Rua Augusta", "maneuver": { "type": "depart" } },
                        { "name": "Avenida Paulista", "maneuver": { "type": "turn", "modifier": "left" } },
                        { "name": "", "maneuver": { "type": "arrive" } }
                    ]
                }]
            }]
        });
        check_code(&body).unwrap();
        let routes = parse_routes(&body).unwrap();
        assert_eq!(
            routes[0].instructions,
            [
                "Depart onto Rua Augusta",
                "Turn left onto Avenida Paulista",
                "Arrive at destination"
            ]
        );
    }

    #[test]
    fn parses_nominatim_place() {
        let body = serde_json::json!({
            "lat": "41.8827",
            "lon": "-87.6278",
            "display_name": "100, North State Street, Chicago, IL, USA",
            "address": {
                "house_number": "100",
                "road": "North State Street",
                "city": "Chicago",
                "state": "Illinois",
                "postcode": "60602",
                "country": "United States"
            }
        });
        let address = parse_place(&body).unwrap();
        assert!((address.coordinates.lat - 41.8827).abs() < 1e-4);
        assert_eq!(address.street.as_deref(), Some("North State Street, 100"));
        assert_eq!(address.city.as_deref(), Some("Chicago"));
    }

    #[test]
    fn excludes_only_apply_to_driving() {
        let driving = RouteOptions {
            mode: TravelMode::Driving,
            avoid_highways: true,
            avoid_tolls: true,
            language: None,
        };
        assert_eq!(exclude_param(&driving).as_deref(), Some("motorway,toll"));

        let walking = RouteOptions {
            mode: TravelMode::Walking,
            ..driving
        };
        assert_eq!(exclude_param(&walking), None);
        assert_eq!(exclude_param(&RouteOptions::default()), None);
    }

    #[tokio::test]
    async fn traffic_is_unsupported() {
        let adapter = OsmAdapter::new(reqwest::Client::new(), "http://nominatim", "http://osrm");
        let route = Route::new("osm", 1.0, 1.0, String::new(), vec![]);
        let err = adapter.traffic_data(&route).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsupported);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn geocodes_over_http() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "Rua Augusta 500".into()))
            .with_status(200)
            .with_body(
                r#"[{"lat":"-23.5525","lon":"-46.6520","display_name":"Rua Augusta, 500, São Paulo","address":{"road":"Rua Augusta","city":"São Paulo"}}]"#,
            )
            .create_async()
            .await;

        let adapter = OsmAdapter::new(reqwest::Client::new(), server.url(), server.url());
        let results = adapter.geocode("Rua Augusta 500").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].city.as_deref(), Some("São Paulo"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retryable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", mockito::Matcher::Regex(r"^/route/v1/foot/.*".to_string()))
            .with_status(503)
            .with_body("upstream unavailable")
            .create_async()
            .await;

        let adapter = OsmAdapter::new(reqwest::Client::new(), server.url(), server.url());
        let origin = Coordinates { lat: -23.55, lng: -46.63 };
        let destination = Coordinates { lat: -23.56, lng: -46.65 };
        let err = adapter
            .calculate_route(origin, destination, &RouteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ServerError);
        assert!(err.retryable);
    }
}
