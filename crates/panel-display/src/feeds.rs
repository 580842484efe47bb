//! Upstream feed clients: the bridge's track push, the analyzer's frame
//! push, and the artwork pull.  Each WebSocket reconnects forever with
//! jittered backoff; the render loop only ever reads the latest value from
//! the watch channels and never blocks on the network.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::StreamExt;
use panel_proto::bands::{BandMode, SpectrumFrame};
use panel_proto::protocol::{BridgeEvent, SpectrumEvent, PROTOCOL_VERSION};
use panel_proto::track::TrackState;
use rand::Rng;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A spectrum frame plus when it arrived, so the renderer can age it.
#[derive(Debug, Clone)]
pub struct TimedFrame {
    pub frame: SpectrumFrame,
    pub received_at: Instant,
}

impl TimedFrame {
    pub fn silent(mode: BandMode) -> Self {
        Self {
            frame: SpectrumFrame::silent(mode),
            // born stale so the renderer starts in quiet mode
            received_at: Instant::now()
                .checked_sub(Duration::from_secs(60))
                .unwrap_or_else(Instant::now),
        }
    }

    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

pub type ArtworkImage = Option<Arc<image::DynamicImage>>;

fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(5));
    exp.min(BACKOFF_MAX) + Duration::from_millis(rand::thread_rng().gen_range(0..500))
}

/// `http://host:port` -> `ws://host:port/ws`
pub fn ws_endpoint(http_base: &str) -> String {
    let base = http_base.trim_end_matches('/');
    if base.starts_with("ws://") || base.starts_with("wss://") {
        if base.ends_with("/ws") {
            base.to_string()
        } else {
            format!("{}/ws", base)
        }
    } else {
        let swapped = base
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        format!("{}/ws", swapped)
    }
}

/// Track push subscriber.  Also drives artwork: whenever `art_rev` changes
/// the bytes are re-pulled with a cache-busting query parameter.
pub async fn bridge_feed(
    http_base: String,
    track_tx: watch::Sender<TrackState>,
    artwork_tx: watch::Sender<ArtworkImage>,
    shutdown: CancellationToken,
) {
    let endpoint = ws_endpoint(&http_base);
    let client = reqwest::Client::new();
    let mut attempt: u32 = 0;
    let mut shown_art_rev: Option<u64> = None;

    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match bridge_session(
            &endpoint,
            &http_base,
            &client,
            &track_tx,
            &artwork_tx,
            &mut shown_art_rev,
            &shutdown,
        )
        .await
        {
            Ok(()) => return,
            Err(e) => info!("bridge feed disconnected: {:#}", e),
        }
        // lost the bridge: present the unknown track rather than stale data
        let _ = track_tx.send(TrackState::unknown());

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn bridge_session(
    endpoint: &str,
    http_base: &str,
    client: &reqwest::Client,
    track_tx: &watch::Sender<TrackState>,
    artwork_tx: &watch::Sender<ArtworkImage>,
    shown_art_rev: &mut Option<u64>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let (stream, _) = connect_async(endpoint)
        .await
        .with_context(|| format!("connecting to {}", endpoint))?;
    info!("subscribed to bridge at {}", endpoint);
    let (_, mut read) = stream.split();

    loop {
        let message = tokio::select! {
            m = read.next() => m,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let message = message.context("bridge socket closed")??;
        let Message::Text(text) = message else { continue };

        let event: BridgeEvent = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                warn!("unparseable bridge message ({}): {:.120}", e, text);
                continue;
            }
        };
        let BridgeEvent::Track {
            protocol_version,
            state,
        } = event;
        if protocol_version != PROTOCOL_VERSION {
            warn!("bridge speaks protocol {}, we speak {}", protocol_version, PROTOCOL_VERSION);
        }

        if state.art_available && *shown_art_rev != Some(state.art_rev) {
            match fetch_artwork(client, http_base, state.art_rev).await {
                Ok(img) => {
                    *shown_art_rev = Some(state.art_rev);
                    let _ = artwork_tx.send(Some(Arc::new(img)));
                }
                Err(e) => warn!("artwork fetch failed: {:#}", e),
            }
        } else if !state.art_available && shown_art_rev.is_some() {
            *shown_art_rev = None;
            let _ = artwork_tx.send(None);
        }

        let _ = track_tx.send(state);
    }
}

async fn fetch_artwork(
    client: &reqwest::Client,
    http_base: &str,
    art_rev: u64,
) -> Result<image::DynamicImage> {
    let url = format!("{}/artwork?v={}", http_base.trim_end_matches('/'), art_rev);
    let response = client
        .get(&url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .context("artwork request failed")?;
    if !response.status().is_success() {
        anyhow::bail!("artwork endpoint returned {}", response.status());
    }
    let bytes = response.bytes().await.context("reading artwork bytes")?;
    let img = image::load_from_memory(&bytes).context("decoding artwork")?;
    debug!("artwork updated ({} bytes, rev {})", bytes.len(), art_rev);
    Ok(img)
}

/// Spectrum frame subscriber.  The hello's band count is checked against
/// the local band tables; a mismatch is logged and frames are used as-is
/// (the renderer clamps to the shorter length).
pub async fn spectrum_feed(
    ws_url: String,
    frame_tx: watch::Sender<TimedFrame>,
    shutdown: CancellationToken,
) {
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        match spectrum_session(&ws_url, &frame_tx, &shutdown).await {
            Ok(()) => return,
            Err(e) => info!("spectrum feed disconnected: {:#}", e),
        }

        let delay = backoff_delay(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}

async fn spectrum_session(
    ws_url: &str,
    frame_tx: &watch::Sender<TimedFrame>,
    shutdown: &CancellationToken,
) -> Result<()> {
    let (stream, _) = connect_async(ws_url)
        .await
        .with_context(|| format!("connecting to {}", ws_url))?;
    info!("subscribed to spectrum at {}", ws_url);
    let (_, mut read) = stream.split();

    loop {
        let message = tokio::select! {
            m = read.next() => m,
            _ = shutdown.cancelled() => return Ok(()),
        };
        let message = message.context("spectrum socket closed")??;
        let Message::Text(text) = message else { continue };

        match serde_json::from_str::<SpectrumEvent>(&text) {
            Ok(SpectrumEvent::Hello {
                protocol_version,
                mode,
                band_count,
            }) => {
                if protocol_version != PROTOCOL_VERSION {
                    warn!(
                        "spectrum speaks protocol {}, we speak {}",
                        protocol_version, PROTOCOL_VERSION
                    );
                }
                if band_count != mode.band_count() {
                    warn!(
                        "spectrum hello declares {} bands, local table has {}",
                        band_count,
                        mode.band_count()
                    );
                }
                debug!("spectrum session: {:?}, {} bands", mode, band_count);
            }
            Ok(SpectrumEvent::Frame(frame)) => {
                let _ = frame_tx.send(TimedFrame {
                    frame,
                    received_at: Instant::now(),
                });
            }
            Err(e) => warn!("unparseable spectrum message ({}): {:.120}", e, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_endpoint_from_http_base() {
        assert_eq!(ws_endpoint("http://127.0.0.1:8080"), "ws://127.0.0.1:8080/ws");
        assert_eq!(ws_endpoint("https://panel.local/"), "wss://panel.local/ws");
        assert_eq!(ws_endpoint("ws://127.0.0.1:8081/ws"), "ws://127.0.0.1:8081/ws");
        assert_eq!(ws_endpoint("ws://127.0.0.1:8081"), "ws://127.0.0.1:8081/ws");
    }

    #[test]
    fn fresh_timed_frame_starts_stale() {
        let tf = TimedFrame::silent(BandMode::HalfOctave);
        assert!(tf.age() > Duration::from_secs(30));
        assert!(tf.frame.is_silent());
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..16 {
            assert!(backoff_delay(attempt) <= BACKOFF_MAX + Duration::from_millis(500));
        }
    }
}
