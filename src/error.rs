use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum WildError {
    #[error("invalid observation date: {0}")]
    InvalidDate(String),

    #[error("invalid coordinate in column {column}: {value}")]
    InvalidCoordinate { column: String, value: String },

    #[error("input table is missing required column: {0}")]
    MissingColumn(String),

    #[error("ledger row is missing its identifier column {0}")]
    MissingIdentifier(String),

    #[error("ledger {0} has a header cut off mid-write; remove the file, it holds no rows")]
    TornHeader(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing Earth Engine project (set earth_engine_project in wildmeta.json)")]
    MissingProject,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error("Nominatim request failed: {0}")]
    LocationHttp(String),

    #[error("Nominatim returned status {status}: {message}")]
    LocationStatus { status: u16, message: String },

    #[error("Open-Meteo request failed: {0}")]
    ClimateHttp(String),

    #[error("Open-Meteo returned status {status}: {message}")]
    ClimateStatus { status: u16, message: String },

    #[error("Earth Engine request failed: {0}")]
    EarthEngineHttp(String),

    #[error("Earth Engine returned status {status}: {message}")]
    EarthEngineStatus { status: u16, message: String },

    #[error("Earth Engine authentication failed: {0}")]
    EarthEngineAuth(String),

    #[error("Earth Engine session already closed")]
    SessionClosed,

    #[error("iNaturalist request failed: {0}")]
    InatHttp(String),

    #[error("iNaturalist returned status {status}: {message}")]
    InatStatus { status: u16, message: String },

    #[error("malformed response from {source_name}: {message}")]
    MalformedResponse {
        source_name: &'static str,
        message: String,
    },

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("call timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("watchdog worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("child process error: {0}")]
    Process(String),
}

impl From<csv::Error> for WildError {
    fn from(err: csv::Error) -> Self {
        WildError::Csv(err.to_string())
    }
}
