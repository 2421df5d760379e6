use std::io::{self, Write};

use serde::Serialize;

use crate::acquire::AcquireSummary;
use crate::orchestrator::{ProgressEvent, ProgressSink, RunSummary};
use crate::supervisor::SupervisorStats;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Human,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_enrich(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_acquire(summary: &AcquireSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_supervise(stats: &SupervisorStats) -> io::Result<()> {
        Self::print_json(stats)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

/// JSON mode keeps stdout clean for the final document.
impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
