//! WebSocket surface: every session gets a `hello` declaring the band mode
//! and count, then one `frame` message per published analysis cycle.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use panel_proto::protocol::SpectrumEvent;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info};

use crate::analyzer::FrameSlot;

pub struct AppState {
    pub slot: Arc<FrameSlot>,
    pub published: watch::Receiver<u64>,
}

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

pub async fn serve(
    app: Arc<AppState>,
    bind_address: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = format!("{}:{}", bind_address, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding spectrum server to {}", addr))?;
    info!("spectrum listening on {}", addr);

    axum::serve(listener, router(app))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("spectrum server failed")
}

async fn ws_handler(State(app): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session(app, socket))
}

async fn session(app: Arc<AppState>, mut socket: WebSocket) {
    let mut published = app.published.clone();
    let mode = app.slot.latest().mode;

    let result: Result<()> = async {
        let hello = serde_json::to_string(&SpectrumEvent::hello(mode))?;
        socket.send(Message::Text(hello)).await?;

        loop {
            tokio::select! {
                changed = published.changed() => {
                    if changed.is_err() {
                        break; // analyzer gone
                    }
                    // always the latest complete frame; missed updates are
                    // fine, this is a lossy visual stream
                    let frame = app.slot.latest();
                    let text = serde_json::to_string(&SpectrumEvent::Frame((*frame).clone()))?;
                    socket.send(Message::Text(text)).await?;
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!("spectrum subscriber dropped: {:#}", e);
    }
}
