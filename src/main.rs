use billing_keeper::actions::Actions;
use billing_keeper::api;
use billing_keeper::config::{AppConfig, Cli};
use billing_keeper::rate::RateGate;
use billing_keeper::scheduler::{self, SchedulerCtx};
use billing_keeper::store::Store;
use clap::Parser;
use eyre::{eyre, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(AppConfig::from_cli(cli)?);

    // Single-instance guard: two keepers reconciling the same fleet would
    // fight over bindings and double-spend the per-identity rate budget.
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&cfg.lock_file)
        .map_err(|e| eyre!("failed to open lock file {}: {e}", cfg.lock_file.display()))?;
    lock_file.try_lock_exclusive().map_err(|e| {
        eyre!(
            "keeper already running or lock unavailable ({}): {e}",
            cfg.lock_file.display()
        )
    })?;
    // Keep file handle alive.
    let _lock_guard = lock_file;

    let store = Store::connect(&cfg.database_url, cfg.db_pool_size())
        .await
        .map_err(|e| eyre!("failed to connect to MySQL: {e}"))?;
    store
        .migrate()
        .await
        .map_err(|e| eyre!("failed to create tables: {e}"))?;

    let gate = Arc::new(RateGate::new(cfg.max_qps_per_account));
    let actions = Actions {
        store: store.clone(),
        cfg: cfg.clone(),
        gate: gate.clone(),
    };

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr)
        .await
        .map_err(|e| eyre!("failed to bind {}: {e}", cfg.listen_addr))?;
    tracing::info!(addr = %cfg.listen_addr, "admin surface listening");
    let api_task = tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, api::router(actions)).await {
            tracing::error!(error = %err, "admin surface stopped");
        }
    });

    tracing::info!(
        identities = cfg.account_names.len(),
        update_interval_s = cfg.update_interval.as_secs(),
        max_workers = cfg.max_workers,
        auto_switch = cfg.enable_auto_switch,
        once = cfg.once,
        "keeper starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let ctx = SchedulerCtx {
        cfg: cfg.clone(),
        store,
        gate,
    };
    let mut scheduler_task = tokio::spawn(scheduler::run(ctx, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
            let _ = (&mut scheduler_task).await;
        }
        result = &mut scheduler_task => {
            if let Err(err) = result {
                tracing::error!(error = %err, "scheduler task ended abnormally");
            }
        }
    }

    api_task.abort();
    tracing::info!("keeper exited");
    Ok(())
}
