//! Concrete [`MapAdapter`](crate::MapAdapter) implementations and the HTTP
//! plumbing they share.
//!
//! Adapters never retry on their own. They classify every failure into a
//! [`ProviderError`] and leave retrying, quota and fallback to
//! [`FallbackMapAdapter`](crate::FallbackMapAdapter).

pub mod google;
pub mod here;
pub mod mapbox;
pub mod osm;

use std::time::Duration;

use crate::{ErrorCode, ProviderError};

pub use google::GoogleMapsAdapter;
pub use here::HereAdapter;
pub use mapbox::MapboxAdapter;
pub use osm::OsmAdapter;

/// Maximum length of the response body preview included in errors.
const BODY_PREVIEW_LEN: usize = 200;

/// Builds the HTTP client shared by one adapter's requests.
///
/// # Errors
///
/// Returns [`ProviderError`] if the TLS backend cannot be initialized.
pub fn build_client(
    provider: &str,
    timeout: Duration,
    user_agent: Option<&str>,
) -> Result<reqwest::Client, ProviderError> {
    let mut builder = reqwest::Client::builder().timeout(timeout);
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_string());
    }
    builder
        .build()
        .map_err(|e| ProviderError::unexpected(provider, e).with_retryable(false))
}

/// Sends a request and parses the body as JSON.
///
/// Transport and HTTP status failures are mapped by [`transport_error`]
/// and [`status_error`]; a 2xx body that is not JSON becomes a retryable
/// [`ErrorCode::InvalidResponse`].
///
/// # Errors
///
/// Returns [`ProviderError`] for any transport, status, or decode failure.
pub async fn send_json(
    provider: &str,
    request: reqwest::RequestBuilder,
) -> Result<serde_json::Value, ProviderError> {
    let response = request
        .send()
        .await
        .map_err(|e| transport_error(provider, &e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| transport_error(provider, &e))?;

    if !status.is_success() {
        log::debug!("{provider}: HTTP {status}, body: {}", preview(&text));
        return Err(status_error(provider, status, &text));
    }

    serde_json::from_str(&text).map_err(|e| {
        ProviderError::invalid_response(
            provider,
            format!(
                "JSON parse failed: {e} (received {} bytes, body preview: {})",
                text.len(),
                preview(&text)
            ),
        )
    })
}

/// Classifies a `reqwest` transport failure.
#[must_use]
pub fn transport_error(provider: &str, e: &reqwest::Error) -> ProviderError {
    let code = if e.is_timeout() {
        ErrorCode::Timeout
    } else if e.is_connect() || e.is_request() || e.is_body() {
        ErrorCode::Network
    } else if e.is_decode() {
        ErrorCode::InvalidResponse
    } else {
        ErrorCode::Unexpected
    };
    ProviderError::new(provider, code, e.to_string())
}

/// Classifies a non-2xx HTTP status.
#[must_use]
pub fn status_error(provider: &str, status: reqwest::StatusCode, body: &str) -> ProviderError {
    let code = match status.as_u16() {
        429 => ErrorCode::RateLimited,
        401 | 403 => ErrorCode::Unauthorized,
        404 => ErrorCode::NotFound,
        s if s >= 500 => ErrorCode::ServerError,
        _ => ErrorCode::InvalidRequest,
    };
    ProviderError::new(provider, code, format!("HTTP {status}: {}", preview(body)))
}

/// Missing credential. Not retryable; the provider is skipped.
#[must_use]
pub fn missing_key(provider: &str) -> ProviderError {
    ProviderError::new(provider, ErrorCode::Unauthorized, "no API key configured")
}

/// No route, address or result for the request.
#[must_use]
pub fn not_found(provider: &str, what: &str) -> ProviderError {
    ProviderError::new(provider, ErrorCode::NotFound, format!("no {what} found"))
}

/// Reads a required number from a JSON object.
///
/// # Errors
///
/// Returns [`ErrorCode::InvalidResponse`] if the field is missing or not a
/// number.
pub fn require_f64(
    provider: &str,
    value: &serde_json::Value,
    field: &str,
) -> Result<f64, ProviderError> {
    value[field].as_f64().ok_or_else(|| {
        ProviderError::invalid_response(provider, format!("missing numeric field '{field}'"))
    })
}

/// Reads an optional non-empty string field.
#[must_use]
pub fn opt_string(value: &serde_json::Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(String::from)
}

fn preview(text: &str) -> String {
    if text.len() > BODY_PREVIEW_LEN {
        let cut: String = text.chars().take(BODY_PREVIEW_LEN).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}

/// Strips HTML tags and collapses whitespace in provider instructions.
#[must_use]
pub fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                out.push(' ');
            }
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_http_statuses() {
        let cases = [
            (429, ErrorCode::RateLimited, true),
            (503, ErrorCode::ServerError, true),
            (500, ErrorCode::ServerError, true),
            (401, ErrorCode::Unauthorized, false),
            (403, ErrorCode::Unauthorized, false),
            (404, ErrorCode::NotFound, false),
            (400, ErrorCode::InvalidRequest, false),
        ];
        for (status, code, retryable) in cases {
            let err = status_error("google", reqwest::StatusCode::from_u16(status).unwrap(), "");
            assert_eq!(err.code, code, "status {status}");
            assert_eq!(err.retryable, retryable, "status {status}");
        }
    }

    #[test]
    fn strips_instruction_markup() {
        assert_eq!(
            strip_html(
                "Turn <b>left</b> onto <b>Rua Augusta</b><div style=\"x\">Destination</div>"
            ),
            "Turn left onto Rua Augusta Destination"
        );
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(BODY_PREVIEW_LEN + 10);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), BODY_PREVIEW_LEN + 3);
    }
}
