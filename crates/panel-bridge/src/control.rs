//! Persistent control connection to the playback server.
//!
//! One long-lived TCP connection carrying line-delimited JSON-RPC: we poll
//! `Server.GetStatus` and consume pushed notifications in between.  A read
//! timeout plus a staleness threshold detect half-open sockets that TCP
//! keepalive alone would miss; drops are retried with bounded, jittered
//! backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use panel_proto::track::{
    detect_codec, parse_audio_format, split_stream_title, PlaybackStatus, StreamKind, TrackState,
};
use rand::Rng;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::mpd::MpdClient;
use crate::state::StateManager;

/// Per-read timeout; a quiet-but-alive connection just re-polls.
const READ_TIMEOUT: Duration = Duration::from_secs(10);
/// No traffic at all for this long means the socket is dead.
const STALENESS_THRESHOLD: Duration = Duration::from_secs(30);
/// Status poll cadence between pushed notifications.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Log at most this many bytes of a malformed server line.
const MALFORMED_SAMPLE_LEN: usize = 120;

pub struct ControlLink {
    host: String,
    port: u16,
    state: Arc<StateManager>,
    mpd: Arc<MpdClient>,
    /// Revision numbers, broadcast whenever the published state changes.
    changed: broadcast::Sender<u64>,
    read_timeout: Duration,
    staleness_threshold: Duration,
}

impl ControlLink {
    pub fn new(
        host: &str,
        port: u16,
        state: Arc<StateManager>,
        mpd: Arc<MpdClient>,
        changed: broadcast::Sender<u64>,
    ) -> Self {
        Self {
            host: host.to_string(),
            port,
            state,
            mpd,
            changed,
            read_timeout: READ_TIMEOUT,
            staleness_threshold: STALENESS_THRESHOLD,
        }
    }

    /// Tighter timeouts for tests; production uses the defaults.
    #[cfg(test)]
    fn with_timeouts(mut self, read_timeout: Duration, staleness_threshold: Duration) -> Self {
        self.read_timeout = read_timeout;
        self.staleness_threshold = staleness_threshold;
        self
    }

    /// Outer reconnect loop.  Never returns except on shutdown.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match self.session(&shutdown).await {
                Ok(()) => return, // shutdown requested inside the session
                Err(e) => {
                    // transport errors are routine; anything else deserves a
                    // closer look in the logs
                    let transport = e
                        .chain()
                        .any(|cause| cause.downcast_ref::<std::io::Error>().is_some());
                    if transport {
                        info!("control connection lost: {:#}", e);
                    } else {
                        warn!("control session error: {:#}", e);
                    }
                }
            }

            if let Some(rev) = self.state.clear().await {
                let _ = self.changed.send(rev);
            }

            let delay = backoff_delay(attempt);
            attempt = attempt.saturating_add(1);
            debug!("reconnecting to control port in {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn session(&self, shutdown: &CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.read_timeout, TcpStream::connect(&addr))
            .await
            .context("control connect timed out")?
            .context("control connect failed")?;
        info!("connected to playback server at {}", addr);

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        let mut last_traffic = Instant::now();
        let mut last_poll = Instant::now() - POLL_INTERVAL; // poll immediately
        let mut request_id: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            if last_poll.elapsed() >= POLL_INTERVAL {
                request_id += 1;
                let request = json!({
                    "id": request_id,
                    "jsonrpc": "2.0",
                    "method": "Server.GetStatus",
                });
                let mut payload = serde_json::to_vec(&request)?;
                payload.extend_from_slice(b"\r\n");
                write_half
                    .write_all(&payload)
                    .await
                    .context("control write failed")?;
                last_poll = Instant::now();
            }

            line.clear();
            let read = tokio::select! {
                r = tokio::time::timeout(self.read_timeout, reader.read_line(&mut line)) => r,
                _ = shutdown.cancelled() => return Ok(()),
            };

            match read {
                Err(_elapsed) => {
                    // quiet socket: tolerated until the staleness threshold
                    if last_traffic.elapsed() > self.staleness_threshold {
                        anyhow::bail!(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "control traffic stale, assuming half-open socket",
                        ));
                    }
                }
                Ok(Ok(0)) => {
                    anyhow::bail!(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "control connection closed by server",
                    ));
                }
                Ok(Ok(_)) => {
                    last_traffic = Instant::now();
                    self.handle_line(line.trim()).await;
                }
                Ok(Err(e)) => return Err(e).context("control read failed"),
            }
        }
    }

    /// Parse and apply one server line.  Malformed JSON is logged with a
    /// truncated sample and dropped; the connection stays up.
    async fn handle_line(&self, line: &str) {
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                warn!(
                    "malformed control message ({}): {:?}",
                    e,
                    truncate_sample(line)
                );
                return;
            }
        };

        let update = if let Some(result) = value.get("result") {
            track_from_status(result)
        } else if let Some(method) = value.get("method").and_then(Value::as_str) {
            self.track_from_notification(method, value.get("params")).await
        } else {
            None
        };

        let Some(mut track) = update else { return };

        // stream sources often carry nothing but an icy title; the music
        // daemon knows the rest
        if needs_daemon_fallback(&track) {
            match self.mpd.current_song().await {
                Ok(pairs) => merge_daemon_pairs(&mut track, &pairs),
                Err(e) => debug!("music daemon fallback failed: {:#}", e),
            }
        }

        if let Some(rev) = self.state.replace(track).await {
            let _ = self.changed.send(rev);
        }
    }

    async fn track_from_notification(&self, method: &str, params: Option<&Value>) -> Option<TrackState> {
        match method {
            "Stream.OnProperties" | "Stream.OnUpdate" => {
                let mut track = self.state.snapshot().await;
                apply_stream_properties(&mut track, params?);
                Some(track)
            }
            "Client.OnVolumeChanged" => {
                let volume = params?.get("volume")?;
                let mut track = self.state.snapshot().await;
                if let Some(pct) = volume.get("percent").and_then(Value::as_u64) {
                    track.volume_percent = pct.min(100) as u8;
                }
                if let Some(muted) = volume.get("muted").and_then(Value::as_bool) {
                    track.muted = muted;
                }
                Some(track)
            }
            other => {
                debug!("ignoring control notification {:?}", other);
                None
            }
        }
    }
}

/// Exponential backoff with jitter, capped at BACKOFF_MAX.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << attempt.min(5));
    let capped = exp.min(BACKOFF_MAX);
    let jitter = rand::thread_rng().gen_range(0..500);
    capped + Duration::from_millis(jitter)
}

fn truncate_sample(line: &str) -> &str {
    let mut end = MALFORMED_SAMPLE_LEN.min(line.len());
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}

/// Build a TrackState from a `Server.GetStatus` result: pick the playing
/// stream (or the first one) and read its properties.
fn track_from_status(result: &Value) -> Option<TrackState> {
    let streams = result.get("server")?.get("streams")?.as_array()?;
    let stream = streams
        .iter()
        .find(|s| s.get("status").and_then(Value::as_str) == Some("playing"))
        .or_else(|| streams.first())?;

    let mut track = TrackState::unknown();
    track.playback_status = match stream.get("status").and_then(Value::as_str) {
        Some("playing") => PlaybackStatus::Playing,
        Some("idle") | Some("paused") => PlaybackStatus::Paused,
        _ => PlaybackStatus::Stopped,
    };
    if let Some(props) = stream.get("properties") {
        apply_stream_properties(&mut track, props);
    }
    Some(track)
}

/// Fold a stream `properties` object into the track.
fn apply_stream_properties(track: &mut TrackState, props: &Value) {
    if let Some(pos) = props.get("position").and_then(Value::as_f64) {
        track.position = pos;
    }
    let Some(metadata) = props.get("metadata") else { return };

    if let Some(title) = metadata.get("title").and_then(Value::as_str) {
        track.title = title.to_string();
    }
    // artist arrives as either a plain string or an array of names
    match metadata.get("artist") {
        Some(Value::String(s)) => track.artist = s.clone(),
        Some(Value::Array(names)) => {
            track.artist = names
                .iter()
                .filter_map(Value::as_str)
                .collect::<Vec<_>>()
                .join(", ");
        }
        _ => {}
    }
    if let Some(album) = metadata.get("album").and_then(Value::as_str) {
        track.album = album.to_string();
    }
    if let Some(duration) = metadata.get("duration").and_then(Value::as_f64) {
        track.duration = duration;
    }
    if let Some(url) = metadata.get("url").and_then(Value::as_str) {
        track.file = url.to_string();
        if url.starts_with("http://") || url.starts_with("https://") {
            track.stream_kind = StreamKind::Radio;
        }
    }
}

/// A stream update with a bare icy string and no artist needs the music
/// daemon's richer view.
fn needs_daemon_fallback(track: &TrackState) -> bool {
    track.artist.is_empty() || track.codec.is_empty()
}

/// Merge `currentsong` + `status` key/value pairs into the track.  Structured
/// tags win; a conventional `"Artist - Title"` icy string is split when no
/// artist tag exists.
fn merge_daemon_pairs(track: &mut TrackState, pairs: &[(String, String)]) {
    let mut audio_format = String::new();
    let mut icy_title = String::new();

    for (key, value) in pairs {
        match key.as_str() {
            "title" => icy_title = value.clone(),
            "artist" if track.artist.is_empty() => track.artist = value.clone(),
            "album" if track.album.is_empty() => track.album = value.clone(),
            "name" if track.album.is_empty() => track.album = value.clone(),
            "file" => {
                track.file = value.clone();
                if value.starts_with("http://") || value.starts_with("https://") {
                    track.stream_kind = StreamKind::Radio;
                }
            }
            "state" => {
                track.playback_status = match value.as_str() {
                    "play" => PlaybackStatus::Playing,
                    "pause" => PlaybackStatus::Paused,
                    _ => PlaybackStatus::Stopped,
                };
            }
            "elapsed" => track.position = value.parse().unwrap_or(track.position),
            "duration" => track.duration = value.parse().unwrap_or(track.duration),
            "audio" => audio_format = value.clone(),
            "bitrate" => track.bitrate = value.parse().unwrap_or(0),
            "volume" => {
                track.volume_percent = value.parse::<i64>().unwrap_or(-1).clamp(0, 100) as u8
            }
            _ => {}
        }
    }

    if !icy_title.is_empty() {
        if track.artist.is_empty() {
            if let Some((artist, title)) = split_stream_title(&icy_title) {
                track.artist = artist;
                track.title = title;
            } else {
                track.title = icy_title;
            }
        } else if track.title.is_empty() {
            track.title = icy_title;
        }
    }

    let (rate, bits) = parse_audio_format(&audio_format);
    if rate > 0 {
        track.sample_rate = rate;
        track.bit_depth = bits;
    }
    if track.codec.is_empty() {
        track.codec = detect_codec(&track.file, &audio_format);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_result_yields_playing_stream() {
        let result = serde_json::json!({
            "server": {
                "streams": [
                    {"id": "spotify", "status": "idle", "properties": {}},
                    {"id": "mpd", "status": "playing", "properties": {
                        "position": 42.5,
                        "metadata": {
                            "title": "Roygbiv",
                            "artist": ["Boards of Canada"],
                            "album": "Music Has the Right to Children",
                            "duration": 150.0,
                        }
                    }},
                ]
            }
        });
        let track = track_from_status(&result).unwrap();
        assert_eq!(track.title, "Roygbiv");
        assert_eq!(track.artist, "Boards of Canada");
        assert_eq!(track.playback_status, PlaybackStatus::Playing);
        assert_eq!(track.position, 42.5);
        assert_eq!(track.duration, 150.0);
    }

    #[test]
    fn artist_accepts_string_or_array() {
        let mut track = TrackState::unknown();
        apply_stream_properties(
            &mut track,
            &serde_json::json!({"metadata": {"artist": "Solo"}}),
        );
        assert_eq!(track.artist, "Solo");

        apply_stream_properties(
            &mut track,
            &serde_json::json!({"metadata": {"artist": ["A", "B"]}}),
        );
        assert_eq!(track.artist, "A, B");
    }

    #[test]
    fn stream_url_marks_radio() {
        let mut track = TrackState::unknown();
        apply_stream_properties(
            &mut track,
            &serde_json::json!({"metadata": {"url": "http://stream.example.com/live"}}),
        );
        assert_eq!(track.stream_kind, StreamKind::Radio);
    }

    #[test]
    fn daemon_pairs_fill_format_fields() {
        let mut track = TrackState::unknown();
        let pairs = vec![
            ("file".to_string(), "music/song.flac".to_string()),
            ("title".to_string(), "Song".to_string()),
            ("artist".to_string(), "Band".to_string()),
            ("state".to_string(), "play".to_string()),
            ("elapsed".to_string(), "12.3".to_string()),
            ("duration".to_string(), "200.0".to_string()),
            ("audio".to_string(), "96000:24:2".to_string()),
            ("volume".to_string(), "63".to_string()),
        ];
        merge_daemon_pairs(&mut track, &pairs);
        assert_eq!(track.codec, "FLAC");
        assert_eq!(track.sample_rate, 96000);
        assert_eq!(track.bit_depth, 24);
        assert_eq!(track.volume_percent, 63);
        assert!(track.is_playing());
    }

    #[test]
    fn icy_title_splits_when_no_artist_tag() {
        let mut track = TrackState::unknown();
        let pairs = vec![
            ("file".to_string(), "https://stream.example.com/hq".to_string()),
            ("title".to_string(), "Pearl Jam - Black".to_string()),
            ("name".to_string(), "Example FM".to_string()),
        ];
        merge_daemon_pairs(&mut track, &pairs);
        assert_eq!(track.artist, "Pearl Jam");
        assert_eq!(track.title, "Black");
        assert_eq!(track.album, "Example FM");
        assert_eq!(track.stream_kind, StreamKind::Radio);
        assert_eq!(track.codec, "RADIO");
    }

    #[test]
    fn icy_title_without_separator_is_kept_whole() {
        let mut track = TrackState::unknown();
        let pairs = vec![("title".to_string(), "Morning Show".to_string())];
        merge_daemon_pairs(&mut track, &pairs);
        assert_eq!(track.title, "Morning Show");
        assert!(track.artist.is_empty());
    }

    #[tokio::test]
    async fn silent_socket_trips_the_staleness_threshold() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and hold the connection open without ever writing
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let (changed, _) = broadcast::channel(8);
        let link = ControlLink::new(
            "127.0.0.1",
            addr.port(),
            Arc::new(StateManager::new()),
            Arc::new(MpdClient::new("127.0.0.1", 1)),
            changed,
        )
        .with_timeouts(Duration::from_millis(50), Duration::from_millis(200));

        let shutdown = CancellationToken::new();
        let start = Instant::now();
        let err = link.session(&shutdown).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(200));
        let io = err
            .chain()
            .find_map(|c| c.downcast_ref::<std::io::Error>())
            .expect("staleness must surface as an io error");
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);
        server.abort();
    }

    #[test]
    fn backoff_is_bounded() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= BACKOFF_MAX + Duration::from_millis(500));
        }
        assert!(backoff_delay(0) >= BACKOFF_BASE);
    }

    #[test]
    fn malformed_sample_is_truncated_on_char_boundary() {
        let long = format!("{{\"x\": \"{}\"}}", "é".repeat(200));
        let sample = truncate_sample(&long);
        assert!(sample.len() <= MALFORMED_SAMPLE_LEN);
        assert!(long.starts_with(sample));
    }
}
