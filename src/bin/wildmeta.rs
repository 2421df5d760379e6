use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use wildmeta::acquire::{AcquireSummary, Acquirer};
use wildmeta::climate::OpenMeteoClient;
use wildmeta::config::{ConfigLoader, ResolvedConfig};
use wildmeta::earthengine::EarthEngineFactory;
use wildmeta::error::WildError;
use wildmeta::inat::InatClient;
use wildmeta::input::{ID_COLUMN, InputTable};
use wildmeta::ledger::CsvLedger;
use wildmeta::location::NominatimClient;
use wildmeta::orchestrator::{Orchestrator, ProgressSink, RunSummary, TracingProgress};
use wildmeta::output::{JsonOutput, OutputMode};
use wildmeta::supervisor::{CommandLauncher, Supervisor, SupervisorStats};

#[derive(Parser)]
#[command(name = "wildmeta")]
#[command(about = "Enrich wildlife observation tables with location, climate, vegetation and water context")]
#[command(version, author)]
struct Cli {
    /// Path to a wildmeta.json config (defaults to ./wildmeta.json when present)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print the run summary as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Collect research-grade observations and their photos into the input table")]
    Acquire(AcquireArgs),
    #[command(about = "Enrich every pending input row and append it to the output table")]
    Enrich,
    #[command(about = "Run enrich in a child process, restarting it at every session ceiling")]
    Supervise,
}

#[derive(Args)]
struct AcquireArgs {
    /// Override the configured row target
    #[arg(long)]
    target: Option<usize>,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<WildError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

/// Anything other than a clean exit makes the supervisor restart the worker.
fn map_exit_code(error: &WildError) -> u8 {
    match error {
        WildError::ConfigRead(_)
        | WildError::ConfigParse(_)
        | WildError::InvalidConfig(_)
        | WildError::MissingProject
        | WildError::MissingColumn(_)
        | WildError::TornHeader(_) => 2,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let resolved = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Acquire(args) => run_acquire(args, resolved, output_mode),
        Commands::Enrich => run_enrich(&resolved, output_mode),
        Commands::Supervise => run_supervise(cli.config.as_deref(), &resolved, output_mode),
    }
}

fn run_acquire(
    args: AcquireArgs,
    mut resolved: ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    if let Some(target) = args.target {
        resolved.acquire.target = target;
    }
    let mut ledger = CsvLedger::open(&resolved.input_csv, ID_COLUMN)?;
    let acquirer = Acquirer::new(InatClient::new()?, &resolved);
    let today = chrono::Local::now().date_naive();
    let summary = acquirer.run(&mut ledger, today, progress_sink(output_mode))?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_acquire(&summary).into_diagnostic()?,
        OutputMode::Human => print_acquire_summary(&summary),
    }
    Ok(())
}

fn run_enrich(resolved: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let project = resolved.require_project()?;
    let input = InputTable::read(&resolved.input_csv)?;
    let mut ledger = CsvLedger::open(&resolved.output_csv, ID_COLUMN)?;
    let mut orchestrator = Orchestrator::new(
        NominatimClient::new()?,
        OpenMeteoClient::new()?,
        EarthEngineFactory::new(project, resolved.watchdog.timeout),
        resolved,
    );
    let summary = orchestrator.run(&input, &mut ledger, progress_sink(output_mode))?;

    match output_mode {
        OutputMode::Json => JsonOutput::print_enrich(&summary).into_diagnostic()?,
        OutputMode::Human => print_enrich_summary(&summary),
    }
    Ok(())
}

fn run_supervise(
    config_path: Option<&str>,
    resolved: &ResolvedConfig,
    output_mode: OutputMode,
) -> miette::Result<()> {
    // fail fast here instead of restarting a worker that can never start
    resolved.require_project()?;

    let program = std::env::current_exe().into_diagnostic()?;
    let mut args = vec!["enrich".to_string()];
    if let Some(path) = config_path {
        args.push("--config".to_string());
        args.push(path.to_string());
    }
    let mut supervisor = Supervisor::new(CommandLauncher::new(program, args), resolved.supervisor);
    let stats = supervisor.run();

    match output_mode {
        OutputMode::Json => JsonOutput::print_supervise(&stats).into_diagnostic()?,
        OutputMode::Human => print_supervise_summary(&stats),
    }
    Ok(())
}

fn progress_sink(output_mode: OutputMode) -> &'static dyn ProgressSink {
    match output_mode {
        OutputMode::Json => &JsonOutput,
        OutputMode::Human => &TracingProgress,
    }
}

fn print_enrich_summary(summary: &RunSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}wildmeta enrich summary{reset}");
    println!(
        "{green}rows enriched this run: {} ({} batches){reset}",
        summary.appended, summary.batches
    );
    println!(
        "{green}rows already done: {} of {}{reset}",
        summary.already_done, summary.total_items
    );
    if summary.rejected > 0 {
        println!("{yellow}rows rejected as invalid: {}{reset}", summary.rejected);
    }
}

fn print_acquire_summary(summary: &AcquireSummary) {
    let green = "\x1b[32m";
    let yellow = "\x1b[33m";
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";

    println!("{cyan}wildmeta acquire summary{reset}");
    println!(
        "{green}new observations: {} ({} pages){reset}",
        summary.downloaded, summary.pages
    );
    println!("{green}table rows: {}{reset}", summary.total);
    if summary.duplicates > 0 || summary.failed_downloads > 0 {
        println!(
            "{yellow}duplicates skipped: {}, failed downloads: {}{reset}",
            summary.duplicates, summary.failed_downloads
        );
    }
    if !summary.reached_target {
        println!("{yellow}source exhausted before reaching the target{reset}");
    }
}

fn print_supervise_summary(stats: &SupervisorStats) {
    let cyan = "\x1b[36m";
    let reset = "\x1b[0m";
    println!(
        "{cyan}worker finished after {} sessions ({} terminated at the ceiling, {} crashed){reset}",
        stats.spawns, stats.kills, stats.crashes
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_map_to_usage_exit_code() {
        assert_eq!(map_exit_code(&WildError::MissingProject), 2);
        assert_eq!(map_exit_code(&WildError::ConfigParse("bad".to_string())), 2);
        assert_eq!(map_exit_code(&WildError::TornHeader("out.csv".to_string())), 2);
        assert_eq!(map_exit_code(&WildError::SessionClosed), 1);
    }
}
