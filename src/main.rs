use anyhow::anyhow;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vellum::config::library::LibraryFile;
use vellum::config::AppConfig;
use vellum::infra::{db::Db, queue::QueueClient, repository::PgMediaRepository, storage::StorageGateway};
use vellum::{jobs, MediaLibrary};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let library_file = LibraryFile::load(&config.library_config)?;

    let db = Db::connect(&config).await?;
    if config.run_migrations {
        db.migrate(Path::new("migrations")).await?;
    }
    let storage = StorageGateway::from_config(
        &library_file.default_backend,
        &library_file.backends,
        config.storage_timeout(),
    )
    .await?;
    let queue = QueueClient::new(&config).await?;

    let library = MediaLibrary::builder(
        Arc::new(PgMediaRepository::new(db)),
        storage,
        Arc::new(library_file.registry()),
    )
    .checksum(library_file.checksum)
    .responsive_policy(library_file.responsive.clone())
    .submitter(Arc::new(queue.clone()))
    .build();

    match config.app_mode.as_str() {
        "worker" => {
            tracing::info!(concurrency = config.worker_concurrency, "starting worker mode");
            let retry = config.retry_policy();
            let mut workers = tokio::task::JoinSet::new();
            for _ in 0..config.worker_concurrency {
                workers.spawn(jobs::derivation_worker::run(
                    library.derivations.clone(),
                    queue.clone(),
                    retry,
                ));
            }
            tokio::select! {
                Some(result) = workers.join_next() => {
                    result??;
                }
                _ = shutdown_signal() => {}
            }
            workers.shutdown().await;
        }
        other => return Err(anyhow!("unknown APP_MODE: {}", other)),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
