mod analyzer;
mod capture;
mod server;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use panel_proto::config::Config;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use analyzer::{Analyzer, FrameSlot};

/// How long to wait before reopening a failed capture device.
const REOPEN_DELAY: Duration = Duration::from_secs(2);
/// Silent-frame cadence while degraded (no device).
const DEGRADED_INTERVAL: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<()> {
    let data_dir = panel_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("spectrum.log");

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
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,panel_spectrum=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let mode = config.spectrum.band_mode;
    let slot = Arc::new(FrameSlot::new(mode));
    let (published_tx, published_rx) = watch::channel(0u64);
    let shutdown = CancellationToken::new();

    // capture + analysis run on a dedicated thread: the cpal stream is not
    // Send and the FFT work must never touch the async executor
    let analysis_slot = slot.clone();
    let analysis_shutdown = shutdown.clone();
    let spectrum_config = config.spectrum.clone();
    let analysis_thread = std::thread::spawn(move || {
        analysis_loop(spectrum_config, analysis_slot, published_tx, analysis_shutdown);
    });

    let app = Arc::new(server::AppState {
        slot,
        published: published_rx,
    });
    let bind_address = config.spectrum.bind_address.clone();
    let port = config.spectrum.port;
    let server_shutdown = shutdown.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::serve(app, &bind_address, port, server_shutdown).await {
            warn!("spectrum server exited: {:#}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    let _ = server_handle.await;
    let _ = analysis_thread.join();
    Ok(())
}

/// Outer capture loop: open the device, feed the analyzer, publish frames.
/// Device failure degrades to silent frames and periodic reopen attempts;
/// the renderer keeps painting either way.
fn analysis_loop(
    config: panel_proto::config::SpectrumConfig,
    slot: Arc<FrameSlot>,
    published: watch::Sender<u64>,
    shutdown: CancellationToken,
) {
    let mut analyzer = Analyzer::new(config.band_mode, config.sample_rate);

    while !shutdown.is_cancelled() {
        let (tx, rx) = capture::channel();
        let session = match capture::open(config.capture_device.as_deref(), config.sample_rate, tx)
        {
            Ok(c) => c,
            Err(e) => {
                warn!("capture open failed: {:#}", e);
                degraded_wait(&mut analyzer, &slot, &published, &shutdown);
                continue;
            }
        };

        loop {
            if shutdown.is_cancelled() {
                return;
            }
            if session.failed.load(std::sync::atomic::Ordering::Relaxed) {
                warn!("capture stream failed, reopening");
                break;
            }
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(samples) => {
                    for frame in analyzer.feed(&samples, Instant::now()) {
                        let seq = frame.seq;
                        slot.publish(frame);
                        let _ = published.send(seq);
                    }
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    // device open but delivering nothing: show silence
                    let frame = analyzer.silent_frame(Instant::now());
                    let seq = frame.seq;
                    slot.publish(frame);
                    let _ = published.send(seq);
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    warn!("capture channel closed, reopening");
                    break;
                }
            }
        }
        drop(session);
        degraded_wait(&mut analyzer, &slot, &published, &shutdown);
    }
}

/// Publish silent frames for one reopen delay.
fn degraded_wait(
    analyzer: &mut Analyzer,
    slot: &FrameSlot,
    published: &watch::Sender<u64>,
    shutdown: &CancellationToken,
) {
    let deadline = Instant::now() + REOPEN_DELAY;
    while Instant::now() < deadline && !shutdown.is_cancelled() {
        let frame = analyzer.silent_frame(Instant::now());
        let seq = frame.seq;
        slot.publish(frame);
        let _ = published.send(seq);
        std::thread::sleep(DEGRADED_INTERVAL);
    }
}
