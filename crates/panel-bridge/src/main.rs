mod artwork;
mod control;
mod mpd;
mod server;
mod sources;
mod ssrf;
mod state;

use std::sync::Arc;

use anyhow::Result;
use panel_proto::config::Config;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use artwork::{ArtworkResolver, ArtworkStore};
use mpd::MpdClient;
use state::StateManager;

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = panel_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("bridge.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,panel_bridge=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let shutdown = CancellationToken::new();
    let state = Arc::new(StateManager::new());
    let mpd = Arc::new(MpdClient::new(&config.server.host, config.server.mpd_port));
    let (changed_tx, _) = broadcast::channel::<u64>(64);

    let artwork_store = ArtworkStore::default();
    let resolver = ArtworkResolver::new(sources::default_chain(
        mpd.clone(),
        &config.server.host,
    )?)
    .with_disk_cache(config.bridge.artwork_cache_dir.clone());

    // artwork resolution runs behind the state updates so a slow fetch never
    // delays a metadata push
    tokio::spawn(artwork_task(
        resolver,
        artwork_store.clone(),
        state.clone(),
        changed_tx.clone(),
        shutdown.clone(),
    ));

    let link = control::ControlLink::new(
        &config.server.host,
        config.server.control_port,
        state.clone(),
        mpd,
        changed_tx.clone(),
    );
    tokio::spawn(link.run(shutdown.clone()));

    let app = Arc::new(server::AppState {
        state,
        artwork: artwork_store,
        changed: changed_tx,
        limits: Mutex::new(server::SubscriberLimits::default()),
        max_subscribers: config.bridge.max_subscribers,
        max_subscribers_per_ip: config.bridge.max_subscribers_per_ip,
    });
    let server_shutdown = shutdown.clone();
    let bind_address = config.bridge.bind_address.clone();
    let port = config.bridge.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(app, &bind_address, port, server_shutdown).await {
            warn!("bridge server exited: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = server_handle.await;
    Ok(())
}

/// Watch for identity changes and keep the served artwork in sync.
async fn artwork_task(
    mut resolver: ArtworkResolver,
    store: ArtworkStore,
    state: Arc<StateManager>,
    changed: broadcast::Sender<u64>,
    shutdown: CancellationToken,
) {
    let mut updates = changed.subscribe();
    let mut last_identity = String::new();

    loop {
        let recv = tokio::select! {
            r = updates.recv() => r,
            _ = shutdown.cancelled() => return,
        };
        match recv {
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }

        let track = state.snapshot().await;
        let identity = track.identity();
        if identity == last_identity {
            continue;
        }
        last_identity = identity.clone();

        if !track.has_track() {
            store.set(None).await;
            continue;
        }

        let asset = resolver.resolve(&track).await;
        let available = asset.is_some();

        store.set(asset).await;
        if let Some(rev) = state.set_art_available(&identity, available).await {
            let _ = changed.send(rev);
        }
    }
}
