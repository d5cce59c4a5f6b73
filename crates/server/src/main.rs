mod api;
mod config;
mod progress;
mod queue;
mod reconcile;
mod scan;
mod state;
mod watch;
mod ws;

use std::sync::Arc;

use axum::Router;
use api::api_router;
use config::{config_path_from_env, load_or_create_config, resolve_music_root, resolve_path};
use library::{open_db, Catalog, FsCoverExtractor, ScanStore};
use metadata::LoftyTagSource;
use parking_lot::RwLock;
use progress::Broadcaster;
use queue::{spawn_workers, LocalJobQueue, RetryPolicy};
use reconcile::Reconciler;
use scan::{ScanOptions, ScanService};
use state::AppState;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use watch::configure_watcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, &config.index_path);
    let covers_path = resolve_path(&config_path, &config.covers_path);
    let music_root = resolve_music_root(&config_path, &config.music_root);
    let bind_addr = format!("0.0.0.0:{}", config.port);

    let db = open_db(&index_path)?;
    let reconciler = Reconciler::new(
        Arc::new(LoftyTagSource),
        Catalog::new(Arc::clone(&db)),
        Arc::new(FsCoverExtractor::new(covers_path)),
    );
    let broadcaster = Broadcaster::new();
    let (queue, jobs) = LocalJobQueue::new();
    let scans = ScanService::new(
        ScanStore::new(db),
        reconciler,
        broadcaster.clone(),
        Arc::new(queue),
        ScanOptions {
            default_root: music_root.clone(),
            settings: config.scan.clone(),
        },
    );

    let shutdown = CancellationToken::new();
    let workers = spawn_workers(
        jobs,
        scans.clone(),
        RetryPolicy::from_settings(&config.queue),
        config.queue.workers,
    );
    let keepalive = broadcaster.spawn_keepalive(config.scan.keepalive(), shutdown.clone());

    let state = AppState {
        config: Arc::new(RwLock::new(config)),
        scans,
        watcher: Arc::new(RwLock::new(None)),
    };

    match music_root {
        Some(root) if root.exists() => configure_watcher(&state, root),
        Some(root) => warn!("Music root {} does not exist", root.display()),
        None => info!("Music root not configured; scan requests must name a rootPath."),
    }

    let app = Router::new()
        .nest("/api/v1", api_router(state.clone()))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    let _ = keepalive.await;
    *state.watcher.write() = None;
    workers.abort();
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
