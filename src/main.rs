use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use outreach_engine::Engine;
use outreach_engine::config::EngineConfig;
use outreach_engine::leader::SchedulerMode;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = EngineConfig::from_env().context("invalid configuration")?;

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _log_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "outreach-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_filter(filter()),
        )
        .with(file_layer)
        .init();

    eprintln!("📬 Outreach Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Scheduler mode: {}", config.scheduler_mode);
    eprintln!(
        "   Copy variation: {}",
        config
            .variation
            .as_ref()
            .map(|v| format!("{} ({})", v.backend, v.model))
            .unwrap_or_else(|| "disabled".to_string())
    );
    if let Some(dir) = &config.log_dir {
        eprintln!("   Logs: {}", dir.display());
    }

    let engine = Engine::from_config(config)
        .await
        .context("failed to build engine")?;
    let running = engine.start().await.context("failed to start schedulers")?;
    if !running {
        eprintln!("   Schedulers idle on this instance\n");
    }

    // A standby keeps asking for the lease so it can take over from a
    // leader that crashed, and a leader that lost it asks to get it back.
    let standby = engine.elector().mode() == SchedulerMode::Leader;
    let mut retry = tokio::time::interval(engine.elector().heartbeat_interval());
    retry.tick().await;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            signal = &mut shutdown => {
                signal.context("failed to listen for ctrl-c")?;
                break;
            }
            _ = retry.tick(), if standby => {
                engine.start().await.context("failed to start schedulers")?;
            }
        }
    }
    info!("Shutdown requested");

    engine.shutdown().await.context("shutdown failed")?;
    Ok(())
}
