use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use scan_runner_rs::coordinator::ScanCoordinator;
use scan_runner_rs::types::{ScanOptions, ScanReport, SessionStatus};

/// scan-runner-rs — single-flight runner for long-running scan workers with
/// live progress, reliable cancellation and failure classification.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "scan-runner-rs",
    version,
    about = "Single-flight runner for long-running scan workers with live progress and reliable cancellation.",
    long_about = None
)]
struct Cli {
    /// Path to the scan worker executable.
    #[arg(long)]
    worker: PathBuf,

    /// Arguments passed to the worker verbatim (everything after `--`).
    #[arg(last = true)]
    worker_args: Vec<String>,

    /// Working directory for the worker.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Directory holding the scan lock artifact.
    #[arg(long, default_value = ".")]
    lock_dir: PathBuf,

    /// Only scan targets seen within this many days. Dropped automatically
    /// if the worker reports no recent targets.
    #[arg(long)]
    recent_days: Option<u32>,

    /// Abort the scan after this many seconds.
    #[arg(long = "timeout-secs")]
    timeout_secs: Option<u64>,

    /// Scan kind recorded in the lock artifact.
    #[arg(long, default_value = "scan")]
    kind: String,

    /// Scope label recorded in the lock artifact (e.g. a country code).
    #[arg(long)]
    scope: Option<String>,

    /// Write the final report as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Echo raw worker output lines to stderr.
    #[arg(long, default_value_t = false)]
    echo_worker: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    println!("scan-runner-rs configuration:");
    println!("  worker       : {}", cli.worker.display());
    println!("  worker_args  : {}", cli.worker_args.join(" "));
    println!("  lock_dir     : {}", cli.lock_dir.display());
    println!(
        "  recent_days  : {}",
        cli.recent_days
            .map(|d| d.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!(
        "  timeout_secs : {}",
        cli.timeout_secs
            .map(|t| t.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    );
    println!("  kind         : {}", cli.kind);
    println!(
        "  scope        : {}",
        cli.scope.as_deref().unwrap_or("<global>")
    );

    let mut options = ScanOptions::new(&cli.worker);
    options.args = cli.worker_args.clone();
    options.cwd = cli.cwd.clone();
    options.recent_days = cli.recent_days;
    options.timeout = cli.timeout_secs.map(Duration::from_secs);
    options.scan_kind = cli.kind.clone();
    options.scope = cli.scope.clone();

    let coordinator = Arc::new(ScanCoordinator::new(&cli.lock_dir));

    // Ctrl-C cancels the running scan instead of tearing the runner down.
    let cancel_target = Arc::clone(&coordinator);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_target.cancel_scan();
    });

    let echo = cli.echo_worker;
    let report = coordinator
        .run_scan(
            &options,
            |update| match update.percentage {
                Some(pct) => println!("[{pct:6.2}%] {}", update.message),
                None => println!("[ .... ] {}", update.message),
            },
            move |line| {
                if echo {
                    eprintln!("{line}");
                }
            },
        )
        .await?;

    println!("\n{}", report.summary);
    if report.stats_found {
        println!("  hosts scanned     : {}", report.stats.hosts_scanned);
        println!("  hosts accessible  : {}", report.stats.hosts_accessible);
        println!("  accessible shares : {}", report.stats.accessible_shares);
    }

    if let Some(path) = cli.output.as_deref() {
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }

    match report.status {
        SessionStatus::Completed | SessionStatus::Cancelled => Ok(()),
        _ => std::process::exit(1),
    }
}

fn write_report_json(path: &std::path::Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
