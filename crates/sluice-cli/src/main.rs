//! 🚀 sluice-cli: the front door. Loads config, sets up logging, and lets the
//! library do the heavy lifting. Like a manager. 🦆

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Ship NDJSON log chunks to OpenSearch / Elasticsearch through the bulk API")]
#[command(version)]
struct Args {
    /// 📜 NDJSON input, one record (or `{"time", "tag", "record"}` envelope) per line.
    input: PathBuf,

    /// 🔧 TOML config. Without it, only `SLUICE_*` env vars are read.
    #[arg(short, long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// 🏷️ Tag for lines that do not carry their own.
    #[arg(short, long, default_value = "sluice.input")]
    tag: String,

    /// 🤫 No progress bar, just logs.
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    match ingest(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(err) => {
            error!("💀 error: {err}");
            let mut the_vibes_are_giving_connection_issues = false;
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {cause}");
                let cause = cause.to_string();
                if cause.contains("error sending request")
                    || cause.contains("onnection refused")
                    || cause.contains("tcp connect error")
                    || cause.contains("dns error")
                {
                    the_vibes_are_giving_connection_issues = true;
                }
            }
            if the_vibes_are_giving_connection_issues {
                error!(
                    "🔧 hint: the cluster does not look reachable. Check `hosts` in the config, \
                     and that the cluster is actually up. Even clusters need a nudge sometimes. ☕"
                );
            }
            ExitCode::FAILURE
        }
    }
}

/// 🎬 Returns `Ok(false)` when the run finished but something was dropped along the way.
async fn ingest(args: Args) -> Result<bool> {
    if let Some(config) = &args.config {
        let exists = config
            .try_exists()
            .with_context(|| format!("💀 could not check whether '{}' exists", config.display()))?;
        anyhow::ensure!(
            exists,
            "💀 config file '{}' does not exist. Relative paths are relative to the cwd, not to the binary.",
            config.display()
        );
    }
    let app_config = sluice::load_config(args.config.as_deref())
        .context("💀 could not load the config. Check the file and the SLUICE_* env vars.")?;

    let report = sluice::run(
        app_config,
        &args.input,
        &args.tag,
        Arc::new(sluice::LogErrorSink),
        !args.quiet,
    )
    .await?;

    println!("{}", report.stats.summary_table(report.elapsed));
    if report.stats.is_clean() {
        info!("✅ every record landed. Pop the champagne. 🍾");
    } else {
        error!(
            "⚠️ {} chunks failed and {} error events were raised. Check the logs above.",
            report.stats.chunks_failed, report.stats.error_events
        );
    }
    Ok(report.stats.is_clean())
}
