use std::sync::Arc;

use clap::Parser;
use fusion_core::{FusionConfig, FusionConfigClient, MemoryTraceSink, TraceSink};
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use fusion_collector::subsystems::cloudwatch::CloudWatchLogSource;
use fusion_collector::subsystems::harvest::{self, RunContext, RunMode};
use fusion_collector::subsystems::store::PgTraceSink;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "fusion.toml")]
    config: String,

    #[arg(short, long, default_value = "scheduled")]
    mode: RunMode,

    /// Keep running every N minutes; without a value uses `run.interval_minutes`.
    #[arg(long, num_args = 0..=1)]
    every: Option<Option<u64>>,

    /// Collect into memory and print the report instead of writing to PostgreSQL.
    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    health: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match FusionConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    let sink: Arc<dyn TraceSink> = if args.dry_run {
        Arc::new(MemoryTraceSink::new())
    } else {
        let pool = match fusion_core::db::create_pool(&config.database).await {
            Ok(p) => p,
            Err(e) => {
                eprintln!("Failed to connect to database: {}", e);
                std::process::exit(1);
            }
        };

        if args.health {
            match fusion_core::db::health_check(&pool).await {
                Ok(v) => println!("✅ PostgreSQL connected: {}", v),
                Err(e) => {
                    println!("❌ PostgreSQL connection failed: {}", e);
                    std::process::exit(1);
                }
            }

            match fusion_core::db::trace_count(&pool).await {
                Ok(n) => println!("✅ fusion_traces rows: {}", n),
                Err(e) => {
                    println!("❌ fusion_traces check failed: {}", e);
                    std::process::exit(1);
                }
            }

            println!("✅ Fusion DB health check passed");
            return Ok(());
        }

        let sink = PgTraceSink::new(pool);
        sink.ensure_schema().await?;
        Arc::new(sink)
    };

    let ctx = RunContext {
        config_client: FusionConfigClient::new(&config.fusion_config)?,
        source: Arc::new(CloudWatchLogSource::new(&config.logs).await),
        sink,
        config,
    };

    if let Some(every) = args.every {
        let interval_minutes = every.unwrap_or(ctx.config.run.interval_minutes).max(1);

        let (tx, _rx) = broadcast::channel(1);
        let shutdown_tx = tx.clone();

        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        });

        harvest::run_harvest_loop(ctx, args.mode, interval_minutes, tx.subscribe()).await;
        return Ok(());
    }

    let report = harvest::execute_run(&ctx, args.mode).await?;

    println!(
        "Run {} ({}): {} functions ({} failed), {} traces, {} stored, {} rejected, {} skipped lines",
        report.run_id,
        report.mode.as_str(),
        report.functions,
        report.functions_failed,
        report.traces,
        report.accepted,
        report.rejected.len(),
        report.diagnostics.len()
    );
    if args.dry_run {
        for rejection in &report.rejected {
            println!("  rejected: {}", rejection);
        }
        for diagnostic in &report.diagnostics {
            println!("  skipped: {}", diagnostic);
        }
    }

    Ok(())
}
