mod child;
mod config;
mod controller;
mod failure;
mod logging;
mod orchestrator;
mod pause;
mod progress;
mod report;
mod resources;
mod retry;
mod session;
mod signals;
mod speed;
mod status;

use clap::Parser;
use config::AcceleratorConfig;
use controller::RestartController;
use orchestrator::Orchestrator;
use pause::PauseController;
use report::{ConsoleReporter, Reporter};
use resources::ResourceMonitor;
use session::DownloadSession;
use status::StatusFile;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exit code for configuration and startup errors.
const EXIT_STARTUP_ERROR: i32 = 2;

/// A Rust CLI tool that supervises a resumable model download: run the
/// download command, watch its throughput, and restart it whenever the
/// transfer stalls so the tool resumes from its checkpoint.
#[derive(Parser, Debug)]
#[command(name = "pull-accelerator", version, about)]
pub struct Cli {
    /// Artifact (model) to download, e.g. `llama3:8b`
    #[arg(value_name = "ARTIFACT")]
    artifact: String,

    /// Config file path
    #[arg(short, long, default_value = "accelerator.toml")]
    config: PathBuf,

    /// Restart when speed stays below this many MB/s (overrides config)
    #[arg(long, value_name = "MBPS")]
    speed_threshold: Option<f64>,

    /// Seconds between speed checks (overrides config)
    #[arg(long, value_name = "SECS")]
    check_interval: Option<u64>,

    /// Max restarts before giving up (overrides config)
    #[arg(long)]
    max_retries: Option<u32>,

    /// Pause the download while host CPU or memory usage is high
    #[arg(long)]
    advanced: bool,

    /// CPU usage (%) above which the download is paused; implies --advanced
    #[arg(long, value_name = "PERCENT")]
    cpu_threshold: Option<f32>,

    /// Memory usage (%) above which the download is paused; implies --advanced
    #[arg(long, value_name = "PERCENT")]
    memory_threshold: Option<f32>,

    /// Seconds to keep the download paused; implies --advanced
    #[arg(long, value_name = "SECS")]
    pause_duration: Option<u64>,

    /// Directory for session logs and status files (overrides config)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Print the last recorded state of ARTIFACT's download and exit
    #[arg(long)]
    status: bool,

    /// Extra console logging (samples and decisions always go to the log file)
    #[arg(short, long)]
    verbose: bool,
}

/// Merge command-line overrides into the loaded config.
fn apply_overrides(cli: &Cli, config: &mut AcceleratorConfig) {
    if let Some(threshold) = cli.speed_threshold {
        config.monitor.speed_threshold_mbps = threshold;
    }
    if let Some(interval) = cli.check_interval {
        config.monitor.check_interval_secs = interval;
    }
    if let Some(retries) = cli.max_retries {
        config.monitor.max_retries = retries;
    }
    if let Some(cpu) = cli.cpu_threshold {
        config.resources.cpu_threshold = cpu;
    }
    if let Some(memory) = cli.memory_threshold {
        config.resources.memory_threshold = memory;
    }
    if let Some(secs) = cli.pause_duration {
        config.resources.pause_duration_secs = secs;
    }
    if cli.advanced
        || cli.cpu_threshold.is_some()
        || cli.memory_threshold.is_some()
        || cli.pause_duration.is_some()
    {
        config.resources.enabled = true;
    }
    if let Some(dir) = &cli.log_dir {
        config.log.dir = dir.clone();
    }
}

/// Print a status file written by a current or previous run.
fn print_status(log_dir: &Path, artifact: &str) -> i32 {
    let file = StatusFile::new(session::status_file_path(log_dir, artifact));
    match file.read() {
        Ok(data) => {
            println!("Artifact:     {}", data.artifact);
            println!("State:        {:?}{}", data.state, if data.paused { " (paused)" } else { "" });
            println!("PID:          {}", data.pid);
            println!("Attempt:      {}", data.attempt);
            println!("Retries:      {}/{}", data.retries, data.max_retries);
            println!("Pauses:       {}", data.pauses);
            match (data.last_percent, data.last_speed_mbps) {
                (Some(p), Some(s)) => println!("Progress:     {p:.0}% at {s:.2} MB/s"),
                (Some(p), None) => println!("Progress:     {p:.0}%"),
                _ => println!("Progress:     unknown"),
            }
            println!("Started:      {}", data.session_start.format("%Y-%m-%d %H:%M:%S"));
            println!("Last update:  {}", data.last_update.format("%Y-%m-%d %H:%M:%S"));
            0
        }
        Err(e) => {
            eprintln!("No status for '{artifact}': {e}");
            1
        }
    }
}

async fn run(cli: Cli) -> i32 {
    let mut config = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_STARTUP_ERROR;
        }
    };
    apply_overrides(&cli, &mut config);
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return EXIT_STARTUP_ERROR;
    }

    if cli.dry_run {
        logging::init_console(cli.verbose);
        println!("Dry run mode: config validated, not running.");
        println!("Artifact: {}", cli.artifact);
        match toml::to_string_pretty(&config) {
            Ok(text) => println!("\n{text}"),
            Err(e) => tracing::warn!(error = %e, "failed to render resolved config"),
        }
        return 0;
    }

    if cli.status {
        return print_status(&config.log.dir, &cli.artifact);
    }

    let session = DownloadSession::new(&cli.artifact, &config);
    let _log_guard = match logging::init_session(&config.log.dir, &session, cli.verbose) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_STARTUP_ERROR;
        }
    };
    tracing::debug!(?cli, "parsed CLI arguments");

    eprintln!("pull-accelerator v{}: {}", env!("CARGO_PKG_VERSION"), session.artifact);
    eprintln!(
        "Speed threshold: {} MB/s, check interval: {} s, max retries: {}",
        config.monitor.speed_threshold_mbps, config.monitor.check_interval_secs, config.monitor.max_retries
    );
    if config.resources.enabled {
        eprintln!(
            "CPU threshold: {}%, memory threshold: {}%, pause duration: {} s",
            config.resources.cpu_threshold,
            config.resources.memory_threshold,
            config.resources.pause_duration_secs
        );
    }
    eprintln!(
        "Detailed log: {}\n",
        logging::log_file_path(&config.log.dir, &session).display()
    );

    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter);
    let controller = RestartController::new(session.clone(), &config, reporter)
        .with_status_file(StatusFile::new(session.status_file(&config.log.dir)));
    let mut orchestrator = Orchestrator::new(controller, config.monitor.check_interval());
    if config.resources.enabled {
        orchestrator = orchestrator.with_pressure_control(
            ResourceMonitor::system(),
            PauseController::new(
                config.resources.cpu_threshold,
                config.resources.memory_threshold,
                config.resources.pause_duration(),
            ),
        );
    }

    let outcome = orchestrator.run(signals::shutdown_signal()).await;

    let summary = orchestrator.summary();
    tracing::info!(
        outcome = ?outcome,
        elapsed_secs = summary.elapsed.as_secs_f64(),
        attempts = summary.attempts,
        retries = summary.retries,
        pauses = summary.pauses.count,
        paused_secs = summary.pauses.total_paused.as_secs(),
        "session finished"
    );
    for record in orchestrator.controller().attempts() {
        tracing::debug!(
            attempt = record.index,
            started_at = %record.started_at.format("%H:%M:%S"),
            ended_at = ?record.ended_at.map(|t| t.format("%H:%M:%S").to_string()),
            end = ?record.end,
            last_percent = ?record.last_percent,
            "attempt record"
        );
    }
    eprintln!("\n{summary}");

    outcome.exit_code()
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    // `run` owns the log guard, so the file is flushed before we exit
    let code = run(cli).await;
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["pull-accelerator"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_artifact_is_required() {
        assert!(Cli::try_parse_from(["pull-accelerator"]).is_err());
    }

    #[test]
    fn test_no_flags_keep_config_values() {
        let cli = parse(&["llama3:8b"]);
        let mut config = AcceleratorConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config, AcceleratorConfig::default());
        assert_eq!(cli.config, PathBuf::from("accelerator.toml"));
    }

    #[test]
    fn test_monitor_overrides() {
        let cli = parse(&[
            "llama3:8b",
            "--speed-threshold",
            "0.5",
            "--check-interval",
            "5",
            "--max-retries",
            "7",
            "--log-dir",
            "/tmp/pulls",
        ]);
        let mut config = AcceleratorConfig::default();
        apply_overrides(&cli, &mut config);
        assert_eq!(config.monitor.speed_threshold_mbps, 0.5);
        assert_eq!(config.monitor.check_interval_secs, 5);
        assert_eq!(config.monitor.max_retries, 7);
        assert_eq!(config.log.dir, PathBuf::from("/tmp/pulls"));
        assert!(!config.resources.enabled);
    }

    #[test]
    fn test_advanced_flag_enables_resource_pausing() {
        let cli = parse(&["llama3:8b", "--advanced"]);
        let mut config = AcceleratorConfig::default();
        apply_overrides(&cli, &mut config);
        assert!(config.resources.enabled);
        assert_eq!(config.resources.cpu_threshold, 80.0);
    }

    #[test]
    fn test_resource_flags_imply_advanced() {
        let cli = parse(&["llama3:8b", "--cpu-threshold", "90", "--pause-duration", "30"]);
        let mut config = AcceleratorConfig::default();
        apply_overrides(&cli, &mut config);
        assert!(config.resources.enabled);
        assert_eq!(config.resources.cpu_threshold, 90.0);
        assert_eq!(config.resources.pause_duration_secs, 30);
        assert_eq!(config.resources.memory_threshold, 80.0);
    }

    #[test]
    fn test_print_status_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(print_status(dir.path(), "nothing:here"), 1);
    }
}
