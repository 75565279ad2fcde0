//! grader - batch compile-and-run driver.
//!
//! Main entry point for the grading binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use eyre::WrapErr;
use grader::{load_config, Grader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(
    name = "grader",
    about = "Compile and run every submission of a programming assignment",
    version
)]
struct Cli {
    /// Assignment root; each immediate subdirectory is one submission
    root: PathBuf,

    /// Config file applied on top of <ROOT>/.grader/config
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Assignment definition file
    #[arg(short, long)]
    definition: Option<PathBuf>,

    /// Per-run timeout in seconds
    #[arg(short, long, value_parser = clap::value_parser!(u32).range(1..))]
    timeout: Option<u32>,

    /// Report output file
    #[arg(short, long)]
    report: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!("failed to create tokio runtime: {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(cli)) {
        error!("{err:?}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> eyre::Result<()> {
    let mut config = load_config(&cli.root, cli.config.as_deref())
        .wrap_err_with(|| format!("failed to load config for {}", cli.root.display()))?;
    if let Some(definition) = cli.definition {
        config.definition_file = definition;
    }
    if let Some(timeout) = cli.timeout {
        config.run_timeout_sec = timeout;
    }
    if let Some(report) = cli.report {
        config.report_file = report;
    }

    let interrupt = CancellationToken::new();
    let grader = Grader::load(&cli.root, config, interrupt.clone())
        .wrap_err("invalid assignment definition")?;
    tokio::spawn(cancel_on_signal(interrupt));

    let batch = grader.run().await.wrap_err("grading failed")?;
    info!(
        report = %batch.report_path.display(),
        submissions = batch.submissions.len(),
        skipped = batch.skipped,
        "report written"
    );
    if let Some(summary) = &batch.summary_path {
        info!(summary = %summary.display(), "summary written");
    }
    Ok(())
}

/// Cancel `interrupt` on SIGINT or SIGTERM.
async fn cancel_on_signal(interrupt: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigint, mut sigterm) =
            match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
                (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
                (Err(err), _) | (_, Err(err)) => {
                    error!("failed to register signal handlers: {err}");
                    return;
                }
            };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT, killing the current run"),
            _ = sigterm.recv() => info!("received SIGTERM, killing the current run"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {err}");
            return;
        }
        info!("received SIGINT, killing the current run");
    }

    interrupt.cancel();
}
