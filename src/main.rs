use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use navigator::config::Config;
use navigator::startup;
use navigator::Navigator;

#[derive(Parser, Debug)]
#[command(name = "navigator")]
#[command(author, version, about = "A multi-tenant reverse proxy with on-demand tenant processes", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "navigator.toml")]
    config: PathBuf,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Validate configuration and startup checks, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let log_level = cli.log_level.as_ref().unwrap_or(&config.logging.level).clone();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting navigator v{}", env!("CARGO_PKG_VERSION"));

    let report = startup::run_startup_checks(&config);
    if cli.check_config {
        println!("{}", report.summary);
        for check in &report.checks {
            let marker = if check.passed { "ok" } else if check.critical { "FAIL" } else { "warn" };
            println!("  [{marker}] {}: {}", check.name, check.message);
        }
        return if report.all_critical_passed { Ok(()) } else { std::process::exit(1) };
    }
    if !report.all_critical_passed {
        anyhow::bail!("startup checks failed: {}", report.summary);
    }

    let metrics_handle = navigator::metrics::init_metrics();
    tracing::info!("prometheus metrics installed");

    let server_config = config.server.clone();
    let idle_config = config.idle.clone();

    let navigator = Navigator::new(config, server_config.port)?.with_metrics(metrics_handle);
    let pipeline = navigator.pipeline.clone();
    let tenants = pipeline.tenants.clone();

    spawn_idle_sweep(tenants.clone(), idle_config.clone());

    navigator::server::run(pipeline, tenants, &server_config).await?;

    tracing::info!("navigator exited cleanly");
    Ok(())
}

/// Periodically stops tenant processes that have been idle past their
/// timeout (spec 4.3 invariant 3, ticked at `[idle].sweep_interval_seconds`).
fn spawn_idle_sweep(tenants: std::sync::Arc<navigator::tenant::TenantAppManager>, idle: navigator::config::IdleConfig) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(idle.sweep_interval_seconds));
        let default_timeout = Duration::from_secs(idle.tenant_idle_seconds);
        let stop_grace = Duration::from_secs(idle.tenant_stop_grace_seconds);
        loop {
            interval.tick().await;
            tenants.sweep_idle(default_timeout, stop_grace).await;
        }
    });
}
