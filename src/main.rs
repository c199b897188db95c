use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};
use wdi_pipeline::{
    assemble::build_pipeline,
    config::RunConfig,
    pipeline::RunContext,
    schedule,
};

/// Run the WDI series summary pipeline once, or on its daily schedule.
#[derive(Parser, Debug)]
struct Args {
    /// Pipeline config (YAML, `${VAR}` expanded from the environment)
    #[arg(long, default_value = "config/series_summary.yaml")]
    config: PathBuf,

    /// Keep running and fire on the schedule until Ctrl-C
    #[arg(long)]
    serve: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    // ─── 2) load config ──────────────────────────────────────────────
    let args = Args::parse();
    let config = RunConfig::from_yaml_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(config = %args.config.display(), pipeline = %config.pipeline.id, "config loaded");

    // ─── 3) define pipeline ──────────────────────────────────────────
    let pipeline = Arc::new(build_pipeline(&config).await?);

    // ─── 4) serve on schedule ────────────────────────────────────────
    if args.serve {
        schedule::serve(pipeline, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("listening for ctrl-c failed: {}", e);
            }
        })
        .await;
        info!("all done");
        return Ok(());
    }

    // ─── 5) or run once ──────────────────────────────────────────────
    let report = pipeline.run(RunContext::manual(Utc::now())).await?;
    for change in &report.history {
        info!(state = %change.state, at = %change.at, "run state");
    }
    if let Some(failure) = report.failure {
        error!(run_id = %report.run_id, "run failed: {}", failure);
        bail!("run {} failed: {}", report.run_id, failure);
    }

    info!(
        run_id = %report.run_id,
        rows = ?report.load.as_ref().and_then(|l| l.rows_loaded),
        "all done"
    );
    Ok(())
}
