use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::climate::ClimateSource;
use crate::config::{OrchestratorConfig, ResolvedConfig, VegetationConfig};
use crate::domain::{EnrichmentResult, WorkItem};
use crate::error::WildError;
use crate::input::InputTable;
use crate::ledger::{Ledger, LedgerEntry};
use crate::location::LocationSource;
use crate::session::{SessionFactory, SessionManager};
use crate::vegetation::{lookup_vegetation, lookup_water_distance};
use crate::watchdog::{Sleeper, ThreadSleeper, Watchdog};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub total_items: usize,
    pub already_done: usize,
    pub rejected: usize,
    pub appended: usize,
    pub batches: usize,
    pub complete: bool,
}

/// Drains every input item missing from the ledger, one batch per session.
pub struct Orchestrator<L, C, F, S = ThreadSleeper>
where
    L: LocationSource,
    C: ClimateSource,
    F: SessionFactory + 'static,
    S: Sleeper + Clone + 'static,
{
    location: Arc<L>,
    climate: Arc<C>,
    sessions: SessionManager<F, S>,
    watchdog: Watchdog<S>,
    sleeper: S,
    config: OrchestratorConfig,
    vegetation: VegetationConfig,
}

impl<L, C, F> Orchestrator<L, C, F, ThreadSleeper>
where
    L: LocationSource,
    C: ClimateSource,
    F: SessionFactory + 'static,
{
    pub fn new(location: L, climate: C, factory: F, config: &ResolvedConfig) -> Self {
        Self::with_sleeper(location, climate, factory, config, ThreadSleeper)
    }
}

impl<L, C, F, S> Orchestrator<L, C, F, S>
where
    L: LocationSource,
    C: ClimateSource,
    F: SessionFactory + 'static,
    S: Sleeper + Clone + 'static,
{
    pub fn with_sleeper(
        location: L,
        climate: C,
        factory: F,
        config: &ResolvedConfig,
        sleeper: S,
    ) -> Self {
        Self {
            location: Arc::new(location),
            climate: Arc::new(climate),
            sessions: SessionManager::new(
                factory,
                sleeper.clone(),
                config.orchestrator.session_retry,
            ),
            watchdog: Watchdog::with_sleeper(config.watchdog, sleeper.clone()),
            sleeper,
            config: config.orchestrator,
            vegetation: config.vegetation,
        }
    }

    pub fn sessions_opened(&self) -> u64 {
        self.sessions.generation()
    }

    /// Returns only once nothing is pending. Source failures never surface
    /// here; only ledger write errors do.
    pub fn run<G: Ledger + ?Sized>(
        &mut self,
        input: &InputTable,
        ledger: &mut G,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, WildError> {
        let mut summary = RunSummary {
            total_items: input.items.len(),
            rejected: input.rejected.len(),
            ..RunSummary::default()
        };
        summary.already_done = input.items.len() - input.pending(ledger).len();

        loop {
            let pending = input.pending(ledger);
            if pending.is_empty() {
                self.sessions.close();
                summary.complete = true;
                sink.event(ProgressEvent {
                    message: format!(
                        "phase=Done; all {} rows enriched ({} this run)",
                        summary.total_items, summary.appended
                    ),
                    elapsed: None,
                });
                tracing::info!(appended = summary.appended, batches = summary.batches, "all rows processed");
                return Ok(summary);
            }

            let batch_len = pending.len().min(self.config.batch_size);
            summary.batches += 1;
            sink.event(ProgressEvent {
                message: format!(
                    "phase=Batch; processing next {batch_len} rows ({} done, {} pending)",
                    ledger.len(),
                    pending.len()
                ),
                elapsed: None,
            });

            let session = self.sessions.reset();
            for item in pending.into_iter().take(batch_len) {
                let started = Instant::now();
                let result = self.enrich(item, &session);
                let entry = LedgerEntry::enriched(item, &result, &chrono::Utc::now().to_rfc3339());
                ledger.append(&entry)?;
                summary.appended += 1;
                sink.event(ProgressEvent {
                    message: format!(
                        "phase=Enrich; {} NDVI={} water={}",
                        item.id,
                        result.vegetation.category,
                        result
                            .water_distance_m
                            .map(|m| format!("{m}m"))
                            .unwrap_or_else(|| "n/a".to_string())
                    ),
                    elapsed: Some(started.elapsed()),
                });
                self.sleeper.sleep(self.config.row_delay);
            }

            tracing::info!(batch = summary.batches, rows = batch_len, "batch complete; recycling session");
            self.sleeper.sleep(self.config.batch_pause);
        }
    }

    /// Location, climate, vegetation and water distance, in that order.
    pub fn enrich(&self, item: &WorkItem, session: &Arc<F::Session>) -> EnrichmentResult {
        let point = item.point;
        let date = item.date;

        let location = {
            let source = Arc::clone(&self.location);
            self.watchdog.guard("location", move || source.reverse(point))
        };
        let climate = {
            let source = Arc::clone(&self.climate);
            self.watchdog
                .guard("climate", move || source.climate(point, date))
        };
        let vegetation = {
            let session = Arc::clone(session);
            let config = self.vegetation;
            self.watchdog.guard("vegetation", move || {
                lookup_vegetation(session.as_ref(), point, date, &config)
            })
        };
        let water_distance_m = {
            let session = Arc::clone(session);
            self.watchdog
                .guard("water", move || lookup_water_distance(session.as_ref(), point))
        };

        EnrichmentResult {
            id: item.id.clone(),
            location: Some(location),
            climate: Some(climate),
            vegetation,
            water_distance_m,
        }
    }
}

/// Logs progress through `tracing`.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}
