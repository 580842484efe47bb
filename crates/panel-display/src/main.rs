mod feeds;
mod framebuffer;
mod render;

use std::time::Instant;

use anyhow::Result;
use panel_proto::config::Config;
use panel_proto::track::TrackState;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use feeds::TimedFrame;
use framebuffer::{Framebuffer, FrameSink};
use render::{PositionClock, Renderer};

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = panel_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("display.log");

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
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,panel_display=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let mode = config.spectrum.band_mode;
    let shutdown = CancellationToken::new();

    let (track_tx, track_rx) = watch::channel(TrackState::unknown());
    let (frame_tx, frame_rx) = watch::channel(TimedFrame::silent(mode));
    let (artwork_tx, artwork_rx) = watch::channel::<feeds::ArtworkImage>(None);

    tokio::spawn(feeds::bridge_feed(
        config.display.bridge_url.clone(),
        track_tx,
        artwork_tx,
        shutdown.clone(),
    ));
    tokio::spawn(feeds::spectrum_feed(
        config.display.spectrum_url.clone(),
        frame_tx,
        shutdown.clone(),
    ));

    let sink = Framebuffer::open(&config.display.fb_device, &config.display.fallback_resolution)?;
    let geometry = sink.geometry();
    info!(
        "rendering {} bands on {}x{}",
        mode.band_count(),
        geometry.width,
        geometry.height
    );
    let renderer = Renderer::new(sink, mode.band_count());

    let loop_shutdown = shutdown.clone();
    let render_handle =
        tokio::spawn(render_loop(renderer, track_rx, frame_rx, artwork_rx, loop_shutdown));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = render_handle.await;
    Ok(())
}

/// Paint at the mode's target rate; each cycle reads only the latest
/// snapshots and never waits on the feeds.
async fn render_loop(
    mut renderer: Renderer<Framebuffer>,
    track_rx: watch::Receiver<TrackState>,
    frame_rx: watch::Receiver<TimedFrame>,
    mut artwork_rx: watch::Receiver<feeds::ArtworkImage>,
    shutdown: CancellationToken,
) {
    let mut clock = PositionClock::new(Instant::now());
    let mut seeded_rev: Option<u64> = None;

    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let now = Instant::now();

        if artwork_rx.has_changed().unwrap_or(false) {
            let art = artwork_rx.borrow_and_update().clone();
            renderer.set_artwork(art.map(|a| (*a).clone()));
        }

        let track = track_rx.borrow().clone();
        if seeded_rev != Some(track.rev) {
            clock.seed(&track, now);
            seeded_rev = Some(track.rev);
        }

        let timed = frame_rx.borrow().clone();
        let position = clock.current(now);

        let mode = match renderer.render(&track, &timed.frame, timed.age(), position) {
            Ok(mode) => mode,
            Err(e) => {
                warn!("render cycle failed: {:#}", e);
                render::Mode::Standby
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(mode.frame_interval()) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
