use clap::Parser;
use krxtrade::application::engine::TradingEngine;
use krxtrade::config::{Settings, TradingMode};
use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Unattended KRX equities trading worker.
#[derive(Debug, Parser)]
#[command(name = "krxtrade", version, about)]
struct Cli {
    /// Trading environment: paper or live.
    #[arg(long, default_value = "paper")]
    mode: String,

    /// Path to trading_config.yaml (defaults to ~/.krxtrade/trading_config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let mode = match TradingMode::from_str(&cli.mode) {
        Ok(mode) => mode,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(1);
        }
    };
    if mode == TradingMode::Live {
        info!("LIVE mode: real orders will be placed");
    }

    let settings = match Settings::load(mode, cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to build runtime: {e}");
            return ExitCode::from(1);
        }
    };

    runtime.block_on(async {
        let engine = match TradingEngine::build(settings).await {
            Ok(engine) => engine,
            Err(e) => {
                error!("engine build failed: {e:#}");
                return ExitCode::from(1);
            }
        };

        if let Err(e) = engine.start().await {
            error!("engine start failed: {e:#}");
            engine.stop().await;
            return ExitCode::from(1);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
            }
            _ = engine.wait_for_shutdown() => {
                info!("shutdown requested internally");
            }
        }

        engine.stop().await;
        ExitCode::SUCCESS
    })
}
