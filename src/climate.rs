use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde_json::Value;

use crate::domain::{Climate, GeoPoint, ObservationDate};
use crate::error::WildError;

pub trait ClimateSource: Send + Sync + 'static {
    fn climate(&self, point: GeoPoint, date: ObservationDate) -> Result<Climate, WildError>;
}

#[derive(Clone)]
pub struct OpenMeteoClient {
    client: Client,
    elevation_url: String,
    archive_url: String,
}

impl OpenMeteoClient {
    pub fn new() -> Result<Self, WildError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wildmeta/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WildError::ClimateHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| WildError::ClimateHttp(err.to_string()))?;
        Ok(Self {
            client,
            elevation_url: "https://api.open-meteo.com/v1/elevation".to_string(),
            archive_url: "https://archive-api.open-meteo.com/v1/archive".to_string(),
        })
    }

    fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, WildError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .map_err(|err| WildError::ClimateHttp(err.to_string()))?;
        read_json(response)
    }
}

fn read_json(response: Response) -> Result<Value, WildError> {
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = response
            .text()
            .unwrap_or_else(|_| "Open-Meteo request failed".to_string());
        return Err(WildError::ClimateStatus { status, message });
    }
    response
        .json()
        .map_err(|err| WildError::ClimateHttp(err.to_string()))
}

impl ClimateSource for OpenMeteoClient {
    fn climate(&self, point: GeoPoint, date: ObservationDate) -> Result<Climate, WildError> {
        let lat = point.latitude.to_string();
        let lon = point.longitude.to_string();

        let elevation = self.get_json(
            &self.elevation_url,
            &[("latitude", lat.clone()), ("longitude", lon.clone())],
        )?;
        let day = date.to_string();
        let archive = self.get_json(
            &self.archive_url,
            &[
                ("latitude", lat),
                ("longitude", lon),
                ("start_date", day.clone()),
                ("end_date", day),
                ("daily", "temperature_2m_mean".to_string()),
                ("timezone", "auto".to_string()),
            ],
        );
        let mean_temp_c = match archive {
            Ok(body) => mean_temperature_from_response(&body)?,
            // 400 means the date is outside the archive; retrying cannot help
            Err(WildError::ClimateStatus { status: 400, message }) => {
                tracing::warn!(date = %date, %message, "archive rejected date; no temperature");
                None
            }
            Err(err) => return Err(err),
        };

        Ok(Climate {
            mean_temp_c,
            elevation_m: elevation_from_response(&elevation),
        })
    }
}

/// Missing elevation is reported as sea level.
pub fn elevation_from_response(body: &Value) -> f64 {
    body.get("elevation")
        .and_then(Value::as_array)
        .and_then(|values| values.first())
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// A missing `daily` block is an error worth retrying; a null reading for the
/// day is "no data".
pub fn mean_temperature_from_response(body: &Value) -> Result<Option<f64>, WildError> {
    let values = body
        .get("daily")
        .and_then(|daily| daily.get("temperature_2m_mean"))
        .and_then(Value::as_array)
        .ok_or_else(|| WildError::MalformedResponse {
            source_name: "Open-Meteo archive",
            message: "missing daily.temperature_2m_mean".to_string(),
        })?;
    Ok(values.first().and_then(Value::as_f64))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_elevation_and_temperature() {
        assert_eq!(elevation_from_response(&json!({"elevation": [1654.0]})), 1654.0);
        assert_eq!(elevation_from_response(&json!({})), 0.0);
        let archive = json!({"daily": {"time": ["2021-06-15"], "temperature_2m_mean": [18.4]}});
        assert_eq!(mean_temperature_from_response(&archive).unwrap(), Some(18.4));
    }

    #[test]
    fn null_reading_is_no_data_but_missing_block_is_an_error() {
        let archive = json!({"daily": {"temperature_2m_mean": [null]}});
        assert_eq!(mean_temperature_from_response(&archive).unwrap(), None);
        assert_matches!(
            mean_temperature_from_response(&json!({"reason": "rate limited"})),
            Err(WildError::MalformedResponse { .. })
        );
    }
}
