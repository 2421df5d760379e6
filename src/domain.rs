use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Duration, NaiveDate};
use serde::Serialize;

use crate::error::WildError;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObservationDate(NaiveDate);

impl ObservationDate {
    pub fn new(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn as_naive(&self) -> NaiveDate {
        self.0
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    /// Same calendar day in `year`; Feb 29 falls back to Feb 28 outside leap years.
    pub fn in_year(&self, year: i32) -> NaiveDate {
        self.0
            .with_year(year)
            .or_else(|| NaiveDate::from_ymd_opt(year, self.0.month(), 28))
            .unwrap_or(self.0)
    }
}

impl fmt::Display for ObservationDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for ObservationDate {
    type Err = WildError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        // some exports carry a time component after the date
        let day = trimmed.get(..10).unwrap_or(trimmed);
        NaiveDate::parse_from_str(day, DATE_FORMAT)
            .map(Self)
            .map_err(|_| WildError::InvalidDate(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn around(center: NaiveDate, days: i64) -> Self {
        Self {
            start: center - Duration::days(days),
            end: center + Duration::days(days),
        }
    }

    pub fn start_str(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

/// One input observation awaiting enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: String,
    pub point: GeoPoint,
    pub date: ObservationDate,
    /// Every input column in input order, the required ones included.
    pub fields: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Location {
    pub country: String,
    pub state: String,
    pub city: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Climate {
    pub mean_temp_c: Option<f64>,
    pub elevation_m: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VegetationCategory {
    Dense,
    Moderate,
    Sparse,
    NonVegetated,
    NoData,
}

impl VegetationCategory {
    pub fn classify(ndvi: f64) -> Self {
        if ndvi > 0.6 {
            VegetationCategory::Dense
        } else if ndvi > 0.3 {
            VegetationCategory::Moderate
        } else if ndvi > 0.1 {
            VegetationCategory::Sparse
        } else {
            VegetationCategory::NonVegetated
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            VegetationCategory::Dense => "Dense",
            VegetationCategory::Moderate => "Moderate",
            VegetationCategory::Sparse => "Sparse",
            VegetationCategory::NonVegetated => "Non-Veg",
            VegetationCategory::NoData => "No Data",
        }
    }
}

impl fmt::Display for VegetationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Vegetation {
    pub ndvi: Option<f64>,
    pub category: VegetationCategory,
    pub year: Option<i32>,
}

impl Vegetation {
    pub fn no_data() -> Self {
        Self {
            ndvi: None,
            category: VegetationCategory::NoData,
            year: None,
        }
    }

    pub fn from_ndvi(ndvi: f64, year: i32) -> Self {
        Self {
            ndvi: Some(ndvi),
            category: VegetationCategory::classify(ndvi),
            year: Some(year),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    pub id: String,
    pub location: Option<Location>,
    pub climate: Option<Climate>,
    pub vegetation: Vegetation,
    pub water_distance_m: Option<f64>,
}

pub const ENRICHMENT_COLUMNS: [&str; 9] = [
    "country",
    "state",
    "city",
    "avg_temp_C",
    "elevation_m",
    "NDVI_value",
    "NDVI_Category",
    "dist_to_water_m",
    "enriched_at",
];

impl EnrichmentResult {
    /// Enrichment cells in `ENRICHMENT_COLUMNS` order; absent values are empty.
    pub fn columns(&self, enriched_at: &str) -> Vec<(String, String)> {
        let (country, state, city) = match &self.location {
            Some(loc) => (loc.country.clone(), loc.state.clone(), loc.city.clone()),
            None => (String::new(), String::new(), String::new()),
        };
        let values = [
            country,
            state,
            city,
            opt_cell(self.climate.and_then(|c| c.mean_temp_c)),
            opt_cell(self.climate.map(|c| c.elevation_m)),
            opt_cell(self.vegetation.ndvi),
            self.vegetation.category.label().to_string(),
            opt_cell(self.water_distance_m),
            enriched_at.to_string(),
        ];
        ENRICHMENT_COLUMNS
            .iter()
            .map(|name| name.to_string())
            .zip(values)
            .collect()
    }
}

fn opt_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
