use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task;
use tracing::{error, info};

use bookie::admin::{self, AdminState};
use bookie::config::Config;
use bookie::ledger::{BookieStorage, DeletedLedgers, LedgerStorage};
use bookie::maintenance::{Maintenance, MaintenanceSettings};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn run(config: Config) -> Result<(), AnyError> {
    let deleted = Arc::new(DeletedLedgers::new());
    let storage = Arc::new(BookieStorage::new(
        config.storage_options(),
        deleted.clone(),
    ));

    info!(
        journal_dir = %config.storage.journal_dir.display(),
        ledger_dirs = config.storage.ledger_dirs.len(),
        readonly = config.server.readonly,
        "Starting ledger storage"
    );
    let starting = storage.clone();
    let recovery = task::spawn_blocking(move || starting.start_with_stats()).await??;
    info!(
        rebuilt_index = recovery.rebuilt_index,
        entries_replayed = recovery.entries_replayed,
        "Recovery finished"
    );

    let maintenance = Maintenance::start(storage.clone(), MaintenanceSettings::from(&config));

    let served = match TcpListener::bind(config.server.admin_addr).await {
        Ok(listener) => {
            admin::serve(
                listener,
                AdminState::new(storage.clone(), deleted),
                shutdown_signal(),
            )
            .await
        }
        Err(err) => Err(err),
    };

    maintenance.shutdown().await;
    let stopping = storage.clone();
    task::spawn_blocking(move || stopping.shutdown()).await??;
    info!("Bookie stopped");

    served?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
