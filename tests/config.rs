use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;

use wildmeta::config::{
    AcquireSection, Config, ConfigLoader, EnrichSection, SupervisorSection, WatchdogSection,
};
use wildmeta::error::WildError;

#[test]
fn parse_config_sections() {
    let config = Config {
        earth_engine_project: Some("wildlife-enrichment".to_string()),
        enrich: EnrichSection {
            batch_size: Some(10),
            row_delay_ms: Some(0),
            ..EnrichSection::default()
        },
        watchdog: WatchdogSection {
            call_timeout_secs: Some(30),
            backoff_max_secs: Some(90),
            ..WatchdogSection::default()
        },
        supervisor: SupervisorSection {
            session_ceiling_secs: Some(600),
            restart_pause_secs: None,
        },
        acquire: AcquireSection {
            target: Some(100),
            ..AcquireSection::default()
        },
        ..Config::default()
    };

    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_eq!(resolved.require_project().unwrap(), "wildlife-enrichment");
    assert_eq!(resolved.orchestrator.batch_size, 10);
    assert_eq!(resolved.orchestrator.row_delay, Duration::ZERO);
    assert_eq!(resolved.watchdog.timeout, Duration::from_secs(30));
    assert_eq!(resolved.watchdog.backoff.base, Duration::from_secs(20));
    assert_eq!(resolved.watchdog.backoff.max, Duration::from_secs(90));
    assert_eq!(resolved.supervisor.session_ceiling, Duration::from_secs(600));
    assert_eq!(resolved.supervisor.restart_pause, Duration::from_secs(5));
    assert_eq!(resolved.acquire.target, 100);
    assert_eq!(resolved.acquire.page_size, 40);
}

#[test]
fn reads_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wildmeta.json");
    fs::write(
        &path,
        r#"{
            "schema_version": 1,
            "input_csv": "data/observations.csv",
            "output_csv": "data/enriched.csv",
            "earth_engine_project": "demo-project",
            "vegetation": { "lookback_years": 3 }
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.input_csv.as_str(), "data/observations.csv");
    assert_eq!(resolved.output_csv.as_str(), "data/enriched.csv");
    assert_eq!(resolved.vegetation.lookback_years, 3);
    assert_eq!(resolved.vegetation.window_days, 16);
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(WildError::ConfigRead(_))
    );
}

#[test]
fn malformed_json_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wildmeta.json");
    fs::write(&path, "{ not json").unwrap();
    assert_matches!(
        ConfigLoader::resolve(Some(path.to_str().unwrap())),
        Err(WildError::ConfigParse(_))
    );
}

#[test]
fn rejects_degenerate_values() {
    let zero_batch = Config {
        enrich: EnrichSection {
            batch_size: Some(0),
            ..EnrichSection::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(zero_batch),
        Err(WildError::InvalidConfig(_))
    );

    let inverted_backoff = Config {
        watchdog: WatchdogSection {
            backoff_base_secs: Some(30),
            backoff_max_secs: Some(10),
            ..WatchdogSection::default()
        },
        ..Config::default()
    };
    assert_matches!(
        ConfigLoader::resolve_config(inverted_backoff),
        Err(WildError::InvalidConfig(_))
    );
}

#[test]
fn blank_project_counts_as_missing() {
    let config = Config {
        earth_engine_project: Some("  ".to_string()),
        ..Config::default()
    };
    let resolved = ConfigLoader::resolve_config(config).unwrap();
    assert_matches!(resolved.require_project(), Err(WildError::MissingProject));
}
