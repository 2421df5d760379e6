use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Map, Value, json};

use crate::domain::{DateWindow, GeoPoint};
use crate::error::WildError;
use crate::session::{EarthSession, SessionFactory};

pub const TOKEN_ENV: &str = "EE_ACCESS_TOKEN";
pub const NDVI_COLLECTION: &str = "MODIS/061/MOD13A1";
pub const FLOW_ACCUMULATION: &str = "WWF/HydroSHEDS/15ACC";

const STREAM_THRESHOLD: u32 = 100;
const DISTANCE_NEIGHBORHOOD: u32 = 512;
const HYDRO_PIXEL_METRES: u32 = 450;
const NDVI_BUFFER_METRES: u32 = 500;
const NDVI_SCALE_METRES: u32 = 1000;

pub struct EarthEngineFactory {
    project: String,
    base_url: String,
    timeout: Duration,
}

impl EarthEngineFactory {
    pub fn new(project: &str, timeout: Duration) -> Self {
        Self {
            project: project.to_string(),
            base_url: "https://earthengine.googleapis.com/v1".to_string(),
            timeout,
        }
    }
}

impl SessionFactory for EarthEngineFactory {
    type Session = EarthEngineSession;

    fn open(&self) -> Result<EarthEngineSession, WildError> {
        let token = access_token()?;
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("wildmeta/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| WildError::EarthEngineHttp(err.to_string()))?,
        );
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| WildError::EarthEngineAuth(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout)
            .build()
            .map_err(|err| WildError::EarthEngineHttp(err.to_string()))?;

        let session = EarthEngineSession {
            client,
            compute_url: format!("{}/projects/{}/value:compute", self.base_url, self.project),
            closed: AtomicBool::new(false),
        };
        // cheap round trip so bad credentials surface here, not mid-batch
        session.compute(constant(json!(1)))?;
        Ok(session)
    }
}

pub struct EarthEngineSession {
    client: Client,
    compute_url: String,
    closed: AtomicBool,
}

impl EarthEngineSession {
    fn compute(&self, node: Value) -> Result<Value, WildError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WildError::SessionClosed);
        }
        let body = json!({
            "expression": {
                "result": "0",
                "values": { "0": node },
            }
        });
        let response = self
            .client
            .post(&self.compute_url)
            .json(&body)
            .send()
            .map_err(|err| WildError::EarthEngineHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Earth Engine request failed".to_string());
            if status == 401 || status == 403 {
                return Err(WildError::EarthEngineAuth(message));
            }
            return Err(WildError::EarthEngineStatus { status, message });
        }
        let payload: Value = response
            .json()
            .map_err(|err| WildError::EarthEngineHttp(err.to_string()))?;
        payload
            .get("result")
            .cloned()
            .ok_or_else(|| WildError::MalformedResponse {
                source_name: "Earth Engine",
                message: "response has no result".to_string(),
            })
    }
}

impl EarthSession for EarthEngineSession {
    fn ndvi_mean(&self, point: GeoPoint, window: DateWindow) -> Result<Option<f64>, WildError> {
        let images = self.compute(ndvi_count_expression(window))?;
        if images.as_u64().unwrap_or(0) == 0 {
            return Ok(None);
        }
        let stats = self.compute(ndvi_stats_expression(point, window))?;
        Ok(read_band(&stats, "NDVI_median"))
    }

    fn stream_distance(&self, point: GeoPoint) -> Result<Option<f64>, WildError> {
        let stats = self.compute(stream_distance_expression(point))?;
        Ok(read_band(&stats, "distance"))
    }

    fn close(&self) -> Result<(), WildError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn constant(value: Value) -> Value {
    json!({ "constantValue": value })
}

fn invoke(function: &str, arguments: Vec<(&str, Value)>) -> Value {
    let arguments: Map<String, Value> = arguments
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    json!({
        "functionInvocationValue": {
            "functionName": function,
            "arguments": arguments,
        }
    })
}

fn point_geometry(point: GeoPoint) -> Value {
    invoke(
        "GeometryConstructors.Point",
        vec![(
            "coordinates",
            constant(json!([point.longitude, point.latitude])),
        )],
    )
}

fn image_constant(value: u32) -> Value {
    invoke("Image.constant", vec![("value", constant(json!(value)))])
}

fn filtered_collection(window: DateWindow) -> Value {
    let range = invoke(
        "DateRange",
        vec![
            ("start", constant(json!(window.start_str()))),
            ("end", constant(json!(window.end_str()))),
        ],
    );
    invoke(
        "Collection.filter",
        vec![
            (
                "collection",
                invoke(
                    "ImageCollection.load",
                    vec![("id", constant(json!(NDVI_COLLECTION)))],
                ),
            ),
            (
                "filter",
                invoke(
                    "Filter.dateRangeContains",
                    vec![
                        ("leftValue", range),
                        ("rightField", constant(json!("system:time_start"))),
                    ],
                ),
            ),
        ],
    )
}

fn reduce_region(image: Value, reducer: &str, geometry: Value, scale: u32) -> Value {
    invoke(
        "Image.reduceRegion",
        vec![
            ("image", image),
            ("reducer", invoke(reducer, Vec::new())),
            ("geometry", geometry),
            ("scale", constant(json!(scale))),
            (
                "crs",
                invoke("Projection", vec![("crs", constant(json!("EPSG:4326")))]),
            ),
            ("bestEffort", constant(json!(true))),
        ],
    )
}

pub fn ndvi_count_expression(window: DateWindow) -> Value {
    invoke(
        "Collection.size",
        vec![("collection", filtered_collection(window))],
    )
}

/// Mean of the window's median NDVI over a buffered bounding box; a buffer
/// avoids single-pixel projection failures.
pub fn ndvi_stats_expression(point: GeoPoint, window: DateWindow) -> Value {
    let median = invoke(
        "ImageCollection.reduce",
        vec![
            ("collection", filtered_collection(window)),
            ("reducer", invoke("Reducer.median", Vec::new())),
        ],
    );
    let area = invoke(
        "Geometry.bounds",
        vec![(
            "geometry",
            invoke(
                "Geometry.buffer",
                vec![
                    ("geometry", point_geometry(point)),
                    ("distance", constant(json!(NDVI_BUFFER_METRES))),
                ],
            ),
        )],
    );
    reduce_region(median, "Reducer.mean", area, NDVI_SCALE_METRES)
}

pub fn stream_distance_expression(point: GeoPoint) -> Value {
    let accumulation = invoke("Image.load", vec![("id", constant(json!(FLOW_ACCUMULATION)))]);
    let streams = invoke(
        "Image.gt",
        vec![
            ("image1", accumulation),
            ("image2", image_constant(STREAM_THRESHOLD)),
        ],
    );
    let squared = invoke(
        "Image.fastDistanceTransform",
        vec![
            ("image", streams),
            ("neighborhood", constant(json!(DISTANCE_NEIGHBORHOOD))),
        ],
    );
    let metres = invoke(
        "Image.multiply",
        vec![
            ("image1", invoke("Image.sqrt", vec![("value", squared)])),
            ("image2", image_constant(HYDRO_PIXEL_METRES)),
        ],
    );
    reduce_region(
        metres,
        "Reducer.first",
        point_geometry(point),
        HYDRO_PIXEL_METRES,
    )
}

pub fn read_band(stats: &Value, band: &str) -> Option<f64> {
    stats.get(band).and_then(Value::as_f64)
}

/// `EE_ACCESS_TOKEN` wins; otherwise ask the gcloud CLI for a fresh token.
fn access_token() -> Result<String, WildError> {
    if let Ok(token) = std::env::var(TOKEN_ENV) {
        if !token.trim().is_empty() {
            return Ok(token.trim().to_string());
        }
    }
    let gcloud = find_in_path("gcloud").ok_or_else(|| WildError::MissingTool("gcloud".to_string()))?;
    let output = Command::new(&gcloud)
        .args(["auth", "print-access-token"])
        .output()
        .map_err(|err| WildError::EarthEngineAuth(err.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(WildError::EarthEngineAuth(if stderr.is_empty() {
            "gcloud auth print-access-token failed".to_string()
        } else {
            stderr
        }));
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(WildError::EarthEngineAuth("gcloud returned an empty token".to_string()));
    }
    Ok(token)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        for candidate in [format!("{name}.cmd"), format!("{name}.exe"), name.to_string()] {
            let full = path.join(candidate);
            if full.is_file() {
                return Some(full);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn window() -> DateWindow {
        DateWindow::around(NaiveDate::from_ymd_opt(2019, 6, 15).unwrap(), 16)
    }

    #[test]
    fn ndvi_expression_targets_modis_window() {
        let expr = ndvi_stats_expression(GeoPoint::new(-1.28, 36.82), window()).to_string();
        assert!(expr.contains(NDVI_COLLECTION));
        assert!(expr.contains("2019-05-30"));
        assert!(expr.contains("2019-07-01"));
        assert!(expr.contains("Reducer.median"));
        assert!(expr.contains("[36.82,-1.28]"));
    }

    #[test]
    fn stream_expression_thresholds_accumulation() {
        let expr = stream_distance_expression(GeoPoint::new(10.0, 20.0));
        let text = expr.to_string();
        assert!(text.contains(FLOW_ACCUMULATION));
        assert!(text.contains("Image.fastDistanceTransform"));
        assert_eq!(
            expr["functionInvocationValue"]["functionName"],
            json!("Image.reduceRegion")
        );
    }

    #[test]
    fn reads_band_values() {
        let stats = json!({"NDVI_median": 6512.5, "distance": null});
        assert_eq!(read_band(&stats, "NDVI_median"), Some(6512.5));
        assert_eq!(read_band(&stats, "distance"), None);
    }
}
