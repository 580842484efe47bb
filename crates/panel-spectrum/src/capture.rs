//! PCM capture off the loopback/monitor device.
//!
//! cpal streams are not Send, so the stream lives on the capture thread and
//! hands mono chunks to the analysis loop over a bounded std channel.  The
//! audio callback must never block: when the channel is full the chunk is
//! dropped, which only ever costs a visual frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tracing::{info, warn};

/// Chunks in flight between the callback and the analyzer.
pub const CHANNEL_DEPTH: usize = 32;

pub struct Capture {
    // kept alive; dropping it stops the callbacks
    _stream: cpal::Stream,
    /// Set by cpal's error callback; the run loop reopens when it sees this.
    pub failed: Arc<AtomicBool>,
}

/// Open the capture device and start streaming mono f32 chunks into `tx`.
pub fn open(
    device_name: Option<&str>,
    sample_rate: u32,
    tx: SyncSender<Vec<f32>>,
) -> Result<Capture> {
    let host = cpal::default_host();

    let device = match device_name {
        Some(name) => host
            .input_devices()
            .context("enumerating capture devices")?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .with_context(|| format!("capture device {:?} not found", name))?,
        None => host
            .default_input_device()
            .context("no default capture device")?,
    };
    info!(
        "capturing from {:?}",
        device.name().unwrap_or_else(|_| "<unnamed>".into())
    );

    let supported = device
        .default_input_config()
        .context("querying capture format")?;
    let channels = supported.channels();
    if channels == 0 {
        bail!("capture device reports zero channels");
    }

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let failed = Arc::new(AtomicBool::new(false));
    let err_flag = failed.clone();
    let err_fn = move |e: cpal::StreamError| {
        warn!("capture stream error: {}", e);
        err_flag.store(true, Ordering::Relaxed);
    };

    let ch = channels as usize;
    let data_fn = move |data: &[f32], _: &cpal::InputCallbackInfo| {
        let mono: Vec<f32> = data
            .chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32)
            .collect();
        match tx.try_send(mono) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => {} // analyzer gone, shutdown
        }
    };

    let stream = device
        .build_input_stream(&config, data_fn, err_fn, None)
        .context("building capture stream")?;
    stream.play().context("starting capture stream")?;

    Ok(Capture {
        _stream: stream,
        failed,
    })
}

/// Channel pair for one capture session.
pub fn channel() -> (SyncSender<Vec<f32>>, Receiver<Vec<f32>>) {
    std::sync::mpsc::sync_channel(CHANNEL_DEPTH)
}
