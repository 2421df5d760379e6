use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{GeoPoint, Location};
use crate::error::WildError;

pub const RURAL_PLACEHOLDER: &str = "Rural";
pub const UNKNOWN_COUNTRY: &str = "Unknown";

const LOCALITY_KEYS: [&str; 4] = ["city", "town", "village", "county"];

pub trait LocationSource: Send + Sync + 'static {
    fn reverse(&self, point: GeoPoint) -> Result<Location, WildError>;
}

#[derive(Clone)]
pub struct NominatimClient {
    client: Client,
    base_url: String,
}

impl NominatimClient {
    pub fn new() -> Result<Self, WildError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wildmeta/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WildError::LocationHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(20))
            .build()
            .map_err(|err| WildError::LocationHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://nominatim.openstreetmap.org".to_string(),
        })
    }
}

impl LocationSource for NominatimClient {
    fn reverse(&self, point: GeoPoint) -> Result<Location, WildError> {
        let url = format!("{}/reverse", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("lat", point.latitude.to_string()),
                ("lon", point.longitude.to_string()),
                ("format", "jsonv2".to_string()),
                ("accept-language", "en".to_string()),
                ("addressdetails", "1".to_string()),
            ])
            .send()
            .map_err(|err| WildError::LocationHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Nominatim request failed".to_string());
            return Err(WildError::LocationStatus { status, message });
        }
        let body: Value = response
            .json()
            .map_err(|err| WildError::LocationHttp(err.to_string()))?;
        Ok(location_from_response(&body))
    }
}

/// City falls back through town, village and county; state falls back to the city.
pub fn location_from_response(body: &Value) -> Location {
    let address = body.get("address");
    let field = |key: &str| {
        address
            .and_then(|addr| addr.get(key))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };

    let city = LOCALITY_KEYS
        .iter()
        .find_map(|key| field(*key))
        .unwrap_or_else(|| RURAL_PLACEHOLDER.to_string());
    let state = field("state").unwrap_or_else(|| city.clone());
    let country = field("country").unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());

    Location {
        country,
        state,
        city,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn full_address() {
        let body = json!({"address": {"country": "Kenya", "state": "Nairobi County", "city": "Nairobi"}});
        let loc = location_from_response(&body);
        assert_eq!(loc.country, "Kenya");
        assert_eq!(loc.state, "Nairobi County");
        assert_eq!(loc.city, "Nairobi");
    }

    #[test]
    fn locality_priority_and_state_fallback() {
        let body = json!({"address": {"country": "Norway", "village": "Reine", "county": "Nordland"}});
        let loc = location_from_response(&body);
        assert_eq!(loc.city, "Reine");
        assert_eq!(loc.state, "Reine");
    }

    #[test]
    fn open_ocean_defaults() {
        let loc = location_from_response(&json!({"error": "Unable to geocode"}));
        assert_eq!(loc.country, UNKNOWN_COUNTRY);
        assert_eq!(loc.city, RURAL_PLACEHOLDER);
        assert_eq!(loc.state, RURAL_PLACEHOLDER);
    }
}
