use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::error::WildError;

pub const DEFAULT_CONFIG_FILE: &str = "wildmeta.json";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub input_csv: Option<String>,
    #[serde(default)]
    pub output_csv: Option<String>,
    #[serde(default)]
    pub image_dir: Option<String>,
    #[serde(default)]
    pub earth_engine_project: Option<String>,
    #[serde(default)]
    pub enrich: EnrichSection,
    #[serde(default)]
    pub watchdog: WatchdogSection,
    #[serde(default)]
    pub supervisor: SupervisorSection,
    #[serde(default)]
    pub vegetation: VegetationSection,
    #[serde(default)]
    pub acquire: AcquireSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct EnrichSection {
    pub batch_size: Option<usize>,
    pub row_delay_ms: Option<u64>,
    pub batch_pause_secs: Option<u64>,
    pub session_retry_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WatchdogSection {
    pub call_timeout_secs: Option<u64>,
    pub backoff_base_secs: Option<u64>,
    pub backoff_step_secs: Option<u64>,
    pub backoff_max_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SupervisorSection {
    pub session_ceiling_secs: Option<u64>,
    pub restart_pause_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VegetationSection {
    pub lookback_years: Option<u32>,
    pub window_days: Option<i64>,
    pub floor_year: Option<i32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AcquireSection {
    pub target: Option<usize>,
    pub page_size: Option<usize>,
    pub delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub step: Duration,
    pub max: Duration,
}

impl Backoff {
    /// Cooldown before retry number `failures` (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let extra = self.step.saturating_mul(failures.saturating_sub(1));
        self.base.saturating_add(extra).min(self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogConfig {
    pub timeout: Duration,
    pub backoff: Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VegetationConfig {
    pub lookback_years: u32,
    pub window_days: i64,
    pub floor_year: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub batch_size: usize,
    pub row_delay: Duration,
    pub batch_pause: Duration,
    pub session_retry: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub session_ceiling: Duration,
    pub restart_pause: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireConfig {
    pub target: usize,
    pub page_size: usize,
    pub delay: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub input_csv: Utf8PathBuf,
    pub output_csv: Utf8PathBuf,
    pub image_dir: Utf8PathBuf,
    pub earth_engine_project: Option<String>,
    pub watchdog: WatchdogConfig,
    pub orchestrator: OrchestratorConfig,
    pub supervisor: SupervisorConfig,
    pub vegetation: VegetationConfig,
    pub acquire: AcquireConfig,
}

impl ResolvedConfig {
    pub fn require_project(&self) -> Result<&str, WildError> {
        self.earth_engine_project
            .as_deref()
            .filter(|project| !project.trim().is_empty())
            .ok_or(WildError::MissingProject)
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// An explicit path must exist; the default `wildmeta.json` is optional.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, WildError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| WildError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| WildError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, WildError> {
        let schema_version = config.schema_version.unwrap_or(1);

        let batch_size = config.enrich.batch_size.unwrap_or(20);
        if batch_size == 0 {
            return Err(WildError::InvalidConfig(
                "enrich.batch_size must be at least 1".to_string(),
            ));
        }
        let lookback_years = config.vegetation.lookback_years.unwrap_or(5);
        if lookback_years == 0 {
            return Err(WildError::InvalidConfig(
                "vegetation.lookback_years must be at least 1".to_string(),
            ));
        }
        let page_size = config.acquire.page_size.unwrap_or(40);
        if page_size == 0 {
            return Err(WildError::InvalidConfig(
                "acquire.page_size must be at least 1".to_string(),
            ));
        }

        let watchdog = WatchdogConfig {
            timeout: secs(config.watchdog.call_timeout_secs, 45),
            backoff: Backoff {
                base: secs(config.watchdog.backoff_base_secs, 20),
                step: secs(config.watchdog.backoff_step_secs, 5),
                max: secs(config.watchdog.backoff_max_secs, 60),
            },
        };
        if watchdog.backoff.max < watchdog.backoff.base {
            return Err(WildError::InvalidConfig(
                "watchdog.backoff_max_secs must not be below backoff_base_secs".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            schema_version,
            input_csv: path_or(config.input_csv, "final_dataset_inat.csv"),
            output_csv: path_or(config.output_csv, "gmgbd_final_pro_ultimate.csv"),
            image_dir: path_or(config.image_dir, "gmgbd_dataset_images"),
            earth_engine_project: config.earth_engine_project,
            watchdog,
            orchestrator: OrchestratorConfig {
                batch_size,
                row_delay: millis(config.enrich.row_delay_ms, 1200),
                batch_pause: secs(config.enrich.batch_pause_secs, 5),
                session_retry: secs(config.enrich.session_retry_secs, 5),
            },
            supervisor: SupervisorConfig {
                session_ceiling: secs(config.supervisor.session_ceiling_secs, 300),
                restart_pause: secs(config.supervisor.restart_pause_secs, 5),
            },
            vegetation: VegetationConfig {
                lookback_years,
                window_days: config.vegetation.window_days.unwrap_or(16),
                floor_year: config.vegetation.floor_year.unwrap_or(2000),
            },
            acquire: AcquireConfig {
                target: config.acquire.target.unwrap_or(25_000),
                page_size,
                delay: millis(config.acquire.delay_ms, 500),
            },
        })
    }
}

fn secs(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn path_or(value: Option<String>, default: &str) -> Utf8PathBuf {
    Utf8PathBuf::from(value.unwrap_or_else(|| default.to_string()))
}
