//! HTTP/WebSocket surface of the bridge: `/ws` pushes TrackState snapshots,
//! `/artwork` serves the current image bytes, `/metadata.json` is the
//! one-shot pull for clients that don't hold a socket open.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use panel_proto::protocol::{BridgeEvent, CLOSE_REASON_PER_IP, CLOSE_REASON_TOTAL, CLOSE_SUBSCRIBER_LIMIT};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::artwork::ArtworkStore;
use crate::state::StateManager;

/// Subscriber accounting, shared by all `/ws` handlers.
#[derive(Default)]
pub struct SubscriberLimits {
    total: usize,
    per_ip: HashMap<IpAddr, usize>,
}

pub enum Admission {
    Accepted,
    OverTotal,
    OverPerIp,
}

impl SubscriberLimits {
    /// Admit or refuse a new subscriber from `ip`.
    pub fn admit(&mut self, ip: IpAddr, max_total: usize, max_per_ip: usize) -> Admission {
        if self.total >= max_total {
            return Admission::OverTotal;
        }
        let count = self.per_ip.entry(ip).or_insert(0);
        if *count >= max_per_ip {
            return Admission::OverPerIp;
        }
        *count += 1;
        self.total += 1;
        Admission::Accepted
    }

    pub fn release(&mut self, ip: IpAddr) {
        self.total = self.total.saturating_sub(1);
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

pub struct AppState {
    pub state: Arc<StateManager>,
    pub artwork: ArtworkStore,
    pub changed: broadcast::Sender<u64>,
    pub limits: Mutex<SubscriberLimits>,
    pub max_subscribers: usize,
    pub max_subscribers_per_ip: usize,
}

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/artwork", get(artwork_handler))
        .route("/metadata.json", get(metadata_handler))
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
        .with_context(|| format!("binding bridge server to {}", addr))?;
    info!("bridge listening on {}", addr);

    axum::serve(
        listener,
        router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("bridge server failed")
}

async fn ws_handler(
    State(app): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| subscriber_session(app, socket, peer.ip()))
}

async fn subscriber_session(app: Arc<AppState>, mut socket: WebSocket, ip: IpAddr) {
    let admission = app
        .limits
        .lock()
        .await
        .admit(ip, app.max_subscribers, app.max_subscribers_per_ip);

    let refuse_reason = match admission {
        Admission::Accepted => None,
        Admission::OverTotal => Some(CLOSE_REASON_TOTAL),
        Admission::OverPerIp => Some(CLOSE_REASON_PER_IP),
    };
    if let Some(reason) = refuse_reason {
        warn!("refusing subscriber from {}: {}", ip, reason);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_SUBSCRIBER_LIMIT,
                reason: reason.into(),
            })))
            .await;
        return;
    }

    debug!("subscriber connected from {}", ip);
    let mut changed = app.changed.subscribe();

    // initial snapshot, then one message per revision
    let result: Result<()> = async {
        send_snapshot(&app, &mut socket).await?;
        loop {
            tokio::select! {
                update = changed.recv() => match update {
                    Ok(_rev) => send_snapshot(&app, &mut socket).await?,
                    // lagged subscribers just get the latest snapshot
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("subscriber {} lagged {} updates", ip, n);
                        send_snapshot(&app, &mut socket).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // clients have nothing to say to us
                    Some(Err(_)) => break,
                },
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        debug!("subscriber {} dropped: {:#}", ip, e);
    }
    app.limits.lock().await.release(ip);
    debug!("subscriber disconnected from {}", ip);
}

async fn send_snapshot(app: &AppState, socket: &mut WebSocket) -> Result<()> {
    let snapshot = app.state.snapshot().await;
    let event = BridgeEvent::track(snapshot);
    let text = serde_json::to_string(&event)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

/// Raw artwork bytes with the sniffed content type.  `?v=` is a cache
/// buster only; all values serve the current asset.
async fn artwork_handler(State(app): State<Arc<AppState>>) -> Response {
    match app.artwork.get().await {
        Some(asset) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, asset.mime)
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(asset.bytes.to_vec()))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn metadata_handler(State(app): State<Arc<AppState>>) -> Response {
    let snapshot = app.state.snapshot().await;
    match serde_json::to_string(&snapshot) {
        Ok(json) => ([(header::CONTENT_TYPE, "application/json")], json).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn per_ip_cap_refuses_the_next_connection() {
        let mut limits = SubscriberLimits::default();
        let peer = ip("192.0.2.1");
        for _ in 0..4 {
            assert!(matches!(limits.admit(peer, 16, 4), Admission::Accepted));
        }
        assert!(matches!(limits.admit(peer, 16, 4), Admission::OverPerIp));
        // a different IP is still fine
        assert!(matches!(limits.admit(ip("192.0.2.2"), 16, 4), Admission::Accepted));
    }

    #[test]
    fn total_cap_refuses_across_ips() {
        let mut limits = SubscriberLimits::default();
        for i in 0..16 {
            let peer = ip(&format!("192.0.2.{}", i + 1));
            assert!(matches!(limits.admit(peer, 16, 4), Admission::Accepted));
        }
        assert!(matches!(
            limits.admit(ip("192.0.2.200"), 16, 4),
            Admission::OverTotal
        ));
    }

    #[test]
    fn release_frees_a_slot() {
        let mut limits = SubscriberLimits::default();
        let peer = ip("192.0.2.1");
        for _ in 0..4 {
            limits.admit(peer, 16, 4);
        }
        assert!(matches!(limits.admit(peer, 16, 4), Admission::OverPerIp));
        limits.release(peer);
        assert!(matches!(limits.admit(peer, 16, 4), Admission::Accepted));
        assert_eq!(limits.total(), 4);
    }

    #[test]
    fn release_of_unknown_ip_is_harmless() {
        let mut limits = SubscriberLimits::default();
        limits.release(ip("192.0.2.99"));
        assert_eq!(limits.total(), 0);
    }
}
