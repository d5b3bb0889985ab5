use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use marquee::config::AppConfig;
use marquee::handlers::{self, Collaborators};
use marquee::store::{LibSqlBackend, TaskStore};
use marquee::tasks::TaskService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let _log_guard = init_tracing(&config);

    eprintln!("🎬 Marquee v{}", env!("CARGO_PKG_VERSION"));

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Task engine ──────────────────────────────────────────────────────
    let engine = &config.engine;
    let service = Arc::new(TaskService::new(Arc::clone(&store), engine.clone()).await);

    // Library services plug in here; without them only housekeeping runs.
    let collaborators = Collaborators::default();
    handlers::register_builtin_handlers(&service, &collaborators).await;

    for schedule in handlers::default_schedules(&collaborators) {
        let name = schedule.name.clone();
        if let Err(e) = service.ensure_scheduled_task(schedule).await {
            tracing::warn!(schedule = %name, "Failed to seed scheduled task: {e}");
        }
    }

    eprintln!(
        "   Pools: high-priority {}, default {}, background {}",
        engine.high_priority_pool.max_workers,
        engine.default_pool.max_workers,
        engine.background_pool.max_workers,
    );
    eprintln!("   Handlers: {}", service.list_handlers().await.len());
    eprintln!(
        "   Scheduler: every {}s\n",
        engine.scheduler_interval.as_secs()
    );

    service.start().await.context("Failed to start task service")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    eprintln!("\n   Shutting down...");
    service.shutdown().await;

    Ok(())
}

/// Stderr logging filtered by `RUST_LOG` (default `info`), plus a daily
/// rolling file when a log directory is configured.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "marquee.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .init();
            None
        }
    }
}
