use std::time::Duration;

use chrono::NaiveDate;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Deserialize;

use crate::domain::DATE_FORMAT;
use crate::error::WildError;

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub photo_url: String,
    pub latitude: f64,
    pub longitude: f64,
    pub scientific_name: String,
    pub common_name: String,
    pub observed_on: Option<String>,
}

pub trait ObservationSource: Send + Sync + 'static {
    /// Research-grade observations with photos, observed on or before `cutoff`.
    fn fetch_page(
        &self,
        page: usize,
        per_page: usize,
        cutoff: NaiveDate,
    ) -> Result<Vec<Observation>, WildError>;

    fn download_image(&self, url: &str) -> Result<Vec<u8>, WildError>;
}

#[derive(Clone)]
pub struct InatClient {
    client: Client,
    base_url: String,
}

impl InatClient {
    pub fn new() -> Result<Self, WildError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wildmeta/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WildError::InatHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| WildError::InatHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: "https://api.inaturalist.org/v1".to_string(),
        })
    }
}

impl ObservationSource for InatClient {
    fn fetch_page(
        &self,
        page: usize,
        per_page: usize,
        cutoff: NaiveDate,
    ) -> Result<Vec<Observation>, WildError> {
        let url = format!("{}/observations", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[
                ("per_page", per_page.to_string()),
                ("page", page.to_string()),
                ("has[]", "photos".to_string()),
                ("quality_grade", "research".to_string()),
                ("order_by", "id".to_string()),
                ("d2", cutoff.format(DATE_FORMAT).to_string()),
            ])
            .send()
            .map_err(|err| WildError::InatHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "iNaturalist request failed".to_string());
            return Err(WildError::InatStatus { status, message });
        }
        let body = response
            .text()
            .map_err(|err| WildError::InatHttp(err.to_string()))?;
        parse_observations(&body)
    }

    fn download_image(&self, url: &str) -> Result<Vec<u8>, WildError> {
        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .map_err(|err| WildError::InatHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(WildError::InatStatus {
                status,
                message: format!("image download failed: {url}"),
            });
        }
        let bytes = response
            .bytes()
            .map_err(|err| WildError::InatHttp(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[derive(Debug, Deserialize)]
struct ObservationPage {
    #[serde(default)]
    results: Vec<RawObservation>,
}

#[derive(Debug, Deserialize)]
struct RawObservation {
    #[serde(default)]
    photos: Vec<RawPhoto>,
    #[serde(default)]
    geojson: Option<RawGeoJson>,
    #[serde(default)]
    taxon: Option<RawTaxon>,
    #[serde(default)]
    observed_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPhoto {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawGeoJson {
    #[serde(default)]
    coordinates: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct RawTaxon {
    name: Option<String>,
    preferred_common_name: Option<String>,
}

/// Observations without a photo or coordinates are dropped. Thumbnails are
/// upgraded to the large rendition.
pub fn parse_observations(body: &str) -> Result<Vec<Observation>, WildError> {
    let page: ObservationPage =
        serde_json::from_str(body).map_err(|err| WildError::MalformedResponse {
            source_name: "iNaturalist",
            message: err.to_string(),
        })?;

    let observations = page
        .results
        .into_iter()
        .filter_map(|raw| {
            let photo_url = raw.photos.first()?.url.as_ref()?.replace("square", "large");
            let coordinates = raw.geojson?.coordinates;
            let (longitude, latitude) = (*coordinates.first()?, *coordinates.get(1)?);
            let taxon = raw.taxon;
            let scientific_name = taxon
                .as_ref()
                .and_then(|t| t.name.clone())
                .unwrap_or_else(|| "Unknown".to_string());
            let common_name = taxon
                .and_then(|t| t.preferred_common_name)
                .unwrap_or_else(|| scientific_name.clone());
            Some(Observation {
                photo_url,
                latitude,
                longitude,
                scientific_name,
                common_name,
                observed_on: raw.observed_on.filter(|date| !date.trim().is_empty()),
            })
        })
        .collect();
    Ok(observations)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_filters_results() {
        let body = r#"{
            "total_results": 3,
            "results": [
                {
                    "photos": [{"url": "https://static.inaturalist.org/photos/1/square.jpg"}],
                    "geojson": {"type": "Point", "coordinates": [36.82, -1.28]},
                    "taxon": {"name": "Panthera leo", "preferred_common_name": "Lion"},
                    "observed_on": "2022-03-04"
                },
                {
                    "photos": [],
                    "geojson": {"coordinates": [1.0, 2.0]}
                },
                {
                    "photos": [{"url": "https://static.inaturalist.org/photos/3/square.jpeg"}],
                    "geojson": {"coordinates": [10.0, 20.0]},
                    "taxon": {"name": "Bubo bubo"}
                }
            ]
        }"#;
        let observations = parse_observations(body).unwrap();
        assert_eq!(observations.len(), 2);
        assert_eq!(
            observations[0].photo_url,
            "https://static.inaturalist.org/photos/1/large.jpg"
        );
        assert_eq!(observations[0].latitude, -1.28);
        assert_eq!(observations[0].common_name, "Lion");
        assert_eq!(observations[1].common_name, "Bubo bubo");
        assert_eq!(observations[1].observed_on, None);
    }
}
