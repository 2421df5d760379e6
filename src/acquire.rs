use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::config::{AcquireConfig, ResolvedConfig};
use crate::domain::DATE_FORMAT;
use crate::error::WildError;
use crate::inat::{Observation, ObservationSource};
use crate::input::{DATE_COLUMN, ID_COLUMN, LATITUDE_COLUMN, LONGITUDE_COLUMN};
use crate::ledger::{Ledger, LedgerEntry, dedup_key, image_filename, key_from_filename};
use crate::orchestrator::{ProgressEvent, ProgressSink};
use crate::store::ImageStore;
use crate::watchdog::{Sleeper, ThreadSleeper, Watchdog};

pub const SCIENTIFIC_NAME_COLUMN: &str = "scientific_name";
pub const COMMON_NAME_COLUMN: &str = "common_name";

/// Observations newer than this many days are left for the next run, so the
/// page ordering stays stable while acquisition resumes.
pub const CUTOFF_LAG_DAYS: u64 = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AcquireSummary {
    pub existing: usize,
    pub downloaded: usize,
    pub duplicates: usize,
    pub failed_downloads: usize,
    pub pages: usize,
    pub total: usize,
    pub reached_target: bool,
}

/// Pages through research-grade observations and appends new ones to the input
/// table until it holds `target` rows.
pub struct Acquirer<O: ObservationSource, S: Sleeper + Clone + 'static = ThreadSleeper> {
    source: Arc<O>,
    store: ImageStore,
    watchdog: Watchdog<S>,
    sleeper: S,
    config: AcquireConfig,
}

impl<O: ObservationSource> Acquirer<O, ThreadSleeper> {
    pub fn new(source: O, config: &ResolvedConfig) -> Self {
        Self::with_sleeper(source, config, ThreadSleeper)
    }
}

impl<O: ObservationSource, S: Sleeper + Clone + 'static> Acquirer<O, S> {
    pub fn with_sleeper(source: O, config: &ResolvedConfig, sleeper: S) -> Self {
        Self {
            source: Arc::new(source),
            store: ImageStore::new(config.image_dir.clone()),
            watchdog: Watchdog::with_sleeper(config.watchdog, sleeper.clone()),
            sleeper,
            config: config.acquire,
        }
    }

    pub fn run<G: Ledger + ?Sized>(
        &self,
        ledger: &mut G,
        today: NaiveDate,
        sink: &dyn ProgressSink,
    ) -> Result<AcquireSummary, WildError> {
        self.store.ensure_root()?;

        let mut seen: HashSet<String> = ledger
            .all_ids()
            .iter()
            .filter_map(|name| key_from_filename(name))
            .collect();
        let mut summary = AcquireSummary {
            existing: ledger.len(),
            ..AcquireSummary::default()
        };
        let cutoff = today
            .checked_sub_days(Days::new(CUTOFF_LAG_DAYS))
            .unwrap_or(today);
        let per_page = self.config.page_size;
        let mut page = ledger.len() / per_page + 1;

        sink.event(ProgressEvent {
            message: format!(
                "phase=Acquire; {} rows present, target {}, starting at page {page}",
                ledger.len(),
                self.config.target
            ),
            elapsed: None,
        });

        while ledger.len() < self.config.target {
            let started = Instant::now();
            let observations = {
                let source = Arc::clone(&self.source);
                self.watchdog.guard("observations", move || {
                    source.fetch_page(page, per_page, cutoff)
                })
            };
            summary.pages += 1;
            if observations.is_empty() {
                tracing::info!(page, "no more observations available");
                break;
            }

            for observation in &observations {
                if ledger.len() >= self.config.target {
                    break;
                }
                let key = dedup_key(&observation.photo_url);
                if seen.contains(&key) {
                    summary.duplicates += 1;
                    continue;
                }
                let filename = image_filename(&key);
                if !self.store.exists(&filename) {
                    match self.source.download_image(&observation.photo_url) {
                        Ok(bytes) => {
                            self.store.write_image(&filename, &bytes)?;
                        }
                        Err(err) => {
                            tracing::warn!(url = %observation.photo_url, error = %err, "image download failed; skipping");
                            summary.failed_downloads += 1;
                            continue;
                        }
                    }
                }
                ledger.append(&observation_entry(&filename, observation, cutoff))?;
                seen.insert(key);
                summary.downloaded += 1;
            }

            sink.event(ProgressEvent {
                message: format!(
                    "phase=Acquire; page {page} done, {}/{} rows",
                    ledger.len(),
                    self.config.target
                ),
                elapsed: Some(started.elapsed()),
            });
            page += 1;
            self.sleeper.sleep(self.config.delay);
        }

        summary.total = ledger.len();
        summary.reached_target = ledger.len() >= self.config.target;
        Ok(summary)
    }
}

/// Observations without a date are stamped with `fallback_date` so the row stays enrichable.
pub fn observation_entry(
    filename: &str,
    observation: &Observation,
    fallback_date: NaiveDate,
) -> LedgerEntry {
    let sighting_date = observation
        .observed_on
        .clone()
        .unwrap_or_else(|| fallback_date.format(DATE_FORMAT).to_string());
    let columns = vec![
        (ID_COLUMN.to_string(), filename.to_string()),
        (
            SCIENTIFIC_NAME_COLUMN.to_string(),
            observation.scientific_name.clone(),
        ),
        (COMMON_NAME_COLUMN.to_string(), observation.common_name.clone()),
        (LATITUDE_COLUMN.to_string(), observation.latitude.to_string()),
        (LONGITUDE_COLUMN.to_string(), observation.longitude.to_string()),
        (DATE_COLUMN.to_string(), sighting_date),
    ];
    LedgerEntry::new(filename, columns)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::config::{Config, ConfigLoader};
    use crate::ledger::MemoryLedger;

    #[derive(Clone)]
    struct NullSleeper;

    impl Sleeper for NullSleeper {
        fn sleep(&self, _duration: Duration) {}
    }

    struct NullProgress;

    impl ProgressSink for NullProgress {
        fn event(&self, _event: ProgressEvent) {}
    }

    struct PagedSource {
        pages: Vec<Vec<Observation>>,
        requested: Mutex<Vec<(usize, NaiveDate)>>,
        broken_url: Option<String>,
    }

    impl ObservationSource for PagedSource {
        fn fetch_page(
            &self,
            page: usize,
            _per_page: usize,
            cutoff: NaiveDate,
        ) -> Result<Vec<Observation>, WildError> {
            self.requested.lock().unwrap().push((page, cutoff));
            Ok(self.pages.get(page - 1).cloned().unwrap_or_default())
        }

        fn download_image(&self, url: &str) -> Result<Vec<u8>, WildError> {
            if self.broken_url.as_deref() == Some(url) {
                return Err(WildError::InatStatus {
                    status: 404,
                    message: "gone".to_string(),
                });
            }
            Ok(url.as_bytes().to_vec())
        }
    }

    fn observation(n: usize) -> Observation {
        Observation {
            photo_url: format!("https://static.example.org/photos/{n}/large.jpg"),
            latitude: -1.0 - n as f64,
            longitude: 36.0,
            scientific_name: "Panthera leo".to_string(),
            common_name: "Lion".to_string(),
            observed_on: Some("2021-07-01".to_string()),
        }
    }

    fn config(dir: &tempfile::TempDir, target: usize, page_size: usize) -> ResolvedConfig {
        let mut resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        resolved.image_dir = Utf8PathBuf::from_path_buf(dir.path().join("images")).unwrap();
        resolved.acquire.target = target;
        resolved.acquire.page_size = page_size;
        resolved
    }

    #[test]
    fn stops_at_target_and_skips_repeats() {
        let dir = tempfile::tempdir().unwrap();
        let source = PagedSource {
            pages: vec![
                vec![observation(1), observation(2), observation(1)],
                vec![observation(3), observation(4), observation(5)],
            ],
            requested: Mutex::new(Vec::new()),
            broken_url: None,
        };
        let acquirer = Acquirer::with_sleeper(source, &config(&dir, 4, 3), NullSleeper);
        let mut ledger = MemoryLedger::new();
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let summary = acquirer.run(&mut ledger, today, &NullProgress).unwrap();

        assert_eq!(summary.downloaded, 4);
        assert_eq!(summary.duplicates, 1);
        assert!(summary.reached_target);
        assert_eq!(ledger.len(), 4);
        let requested = acquirer.source.requested.lock().unwrap().clone();
        assert_eq!(
            requested,
            vec![
                (1, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()),
                (2, NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()),
            ]
        );
        let first = &ledger.entries()[0];
        assert_eq!(first.get(COMMON_NAME_COLUMN), Some("Lion"));
        assert_eq!(first.get(DATE_COLUMN), Some("2021-07-01"));
        assert!(dir.path().join("images").join(&first.id).is_file());
    }

    #[test]
    fn failed_download_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let broken = observation(2).photo_url;
        let source = PagedSource {
            pages: vec![vec![observation(1), observation(2), observation(3)]],
            requested: Mutex::new(Vec::new()),
            broken_url: Some(broken),
        };
        let acquirer = Acquirer::with_sleeper(source, &config(&dir, 10, 3), NullSleeper);
        let mut ledger = MemoryLedger::new();
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let summary = acquirer.run(&mut ledger, today, &NullProgress).unwrap();

        assert_eq!(summary.downloaded, 2);
        assert_eq!(summary.failed_downloads, 1);
        assert!(!summary.reached_target);
        assert_eq!(summary.pages, 2);
    }

    #[test]
    fn resumes_from_page_after_existing_rows() {
        let dir = tempfile::tempdir().unwrap();
        let source = PagedSource {
            pages: vec![
                vec![observation(1), observation(2)],
                vec![observation(3), observation(4)],
            ],
            requested: Mutex::new(Vec::new()),
            broken_url: None,
        };
        let acquirer = Acquirer::with_sleeper(source, &config(&dir, 3, 2), NullSleeper);
        let mut ledger = MemoryLedger::new();
        for n in [1, 2] {
            let obs = observation(n);
            let filename = image_filename(&dedup_key(&obs.photo_url));
            let fallback = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();
            ledger.append(&observation_entry(&filename, &obs, fallback)).unwrap();
        }
        let today = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();

        let summary = acquirer.run(&mut ledger, today, &NullProgress).unwrap();

        assert_eq!(summary.existing, 2);
        assert_eq!(summary.downloaded, 1);
        assert_eq!(acquirer.source.requested.lock().unwrap()[0].0, 2);
    }

    #[test]
    fn undated_observation_gets_cutoff_date() {
        let mut obs = observation(9);
        obs.observed_on = None;
        let cutoff = NaiveDate::from_ymd_opt(2024, 3, 8).unwrap();

        let entry = observation_entry("img_0123456789abcdef.jpg", &obs, cutoff);

        assert_eq!(entry.id, "img_0123456789abcdef.jpg");
        assert_eq!(entry.get(DATE_COLUMN), Some("2024-03-08"));
        assert_eq!(entry.get(LATITUDE_COLUMN), Some("-10"));
    }
}
