use serde::{Deserialize, Serialize};

/// What kind of source the current track comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    #[default]
    File,
    Radio,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    Playing,
    Paused,
    #[default]
    Stopped,
}

/// Snapshot of what is currently playing on the remote server.
///
/// Owned exclusively by the bridge's `StateManager` and replaced atomically
/// on every update, so consumers only ever see whole snapshots.  `rev` is a
/// monotonic counter bumped on every change; `art_rev` is bumped whenever
/// the served artwork bytes change, so display clients know when to re-pull
/// `/artwork`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TrackState {
    #[serde(default)]
    pub rev: u64,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub stream_kind: StreamKind,
    pub playback_status: PlaybackStatus,
    /// Elapsed seconds into the track, as last reported by the server.
    pub position: f64,
    /// Track length in seconds; 0.0 for endless streams.
    pub duration: f64,
    pub volume_percent: u8,
    pub muted: bool,
    /// Source URI as the music daemon reports it (file path or stream URL).
    #[serde(default)]
    pub file: String,
    /// Codec label for the format badge ("FLAC", "MP3", "RADIO", ...).
    #[serde(default)]
    pub codec: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default)]
    pub bit_depth: u32,
    /// kbps, lossy sources only.
    #[serde(default)]
    pub bitrate: u32,
    /// True once the bridge has artwork bytes for this track.
    #[serde(default)]
    pub art_available: bool,
    #[serde(default)]
    pub art_rev: u64,
}

impl TrackState {
    /// The "unknown" sentinel published on control-connection loss.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// Track identity used as the artwork cache key.  Artwork is invalidated
    /// only when this changes, not on position/volume updates.
    pub fn identity(&self) -> String {
        format!("{}|{}|{}", self.title, self.artist, self.album)
    }

    pub fn is_playing(&self) -> bool {
        self.playback_status == PlaybackStatus::Playing
    }

    pub fn has_track(&self) -> bool {
        !self.title.is_empty() || !self.artist.is_empty()
    }

    /// Enforce the timeline invariant: never expose `position > duration`
    /// alongside a positive duration.  Streams report duration 0 and keep
    /// whatever position the server sent.
    pub fn clamp_timeline(&mut self) {
        if self.duration > 0.0 && self.position > self.duration {
            self.position = self.duration;
        }
        if self.position < 0.0 {
            self.position = 0.0;
        }
    }
}

/// Derive a codec label the way the music daemon reports files: from the
/// path extension, or RADIO for http(s) sources, or PCM for float pipes.
pub fn detect_codec(file: &str, audio_format: &str) -> String {
    if file.starts_with("http://") || file.starts_with("https://") {
        return "RADIO".to_string();
    }
    if let Some(ext) = file.rsplit('.').next().filter(|e| *e != file) {
        if !ext.contains('/') {
            return ext.to_ascii_uppercase();
        }
    }
    // pipe:// and friends: float format means raw PCM
    if audio_format.split(':').nth(1) == Some("f") {
        return "PCM".to_string();
    }
    String::new()
}

/// Parse MPD's `audio: rate:bits:channels` string. `f` bits means 32-bit
/// float.  Malformed input yields (0, 0).
pub fn parse_audio_format(audio: &str) -> (u32, u32) {
    let mut parts = audio.split(':');
    let (Some(rate), Some(bits)) = (parts.next(), parts.next()) else {
        return (0, 0);
    };
    let rate = rate.parse::<u32>().unwrap_or(0);
    let bits = if bits == "f" {
        32
    } else {
        bits.parse::<u32>().unwrap_or(0)
    };
    (rate, bits)
}

/// Parse a conventional `"Artist - Title"` stream title.  Returns None when
/// there is no separator; the caller then uses the whole string as title.
pub fn split_stream_title(raw: &str) -> Option<(String, String)> {
    let (artist, title) = raw.split_once(" - ")?;
    let artist = artist.trim();
    let title = title.trim();
    if artist.is_empty() || title.is_empty() {
        return None;
    }
    Some((artist.to_string(), title.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_ignores_position() {
        let mut a = TrackState {
            title: "Ten".into(),
            artist: "Pearl Jam".into(),
            album: "Ten".into(),
            position: 10.0,
            ..Default::default()
        };
        let id = a.identity();
        a.position = 99.0;
        assert_eq!(a.identity(), id);
    }

    #[test]
    fn timeline_invariant_clamps_position() {
        let mut t = TrackState {
            position: 250.0,
            duration: 204.0,
            ..Default::default()
        };
        t.clamp_timeline();
        assert_eq!(t.position, 204.0);
    }

    #[test]
    fn timeline_invariant_leaves_streams_alone() {
        let mut t = TrackState {
            position: 5000.0,
            duration: 0.0,
            ..Default::default()
        };
        t.clamp_timeline();
        assert_eq!(t.position, 5000.0);
    }

    #[test]
    fn detect_codec_extensions() {
        assert_eq!(detect_codec("music/song.flac", ""), "FLAC");
        assert_eq!(detect_codec("song.mp3", ""), "MP3");
        assert_eq!(detect_codec("file.xyz", ""), "XYZ");
        assert_eq!(detect_codec("noext", ""), "");
    }

    #[test]
    fn detect_codec_urls_are_radio() {
        assert_eq!(detect_codec("http://stream.example.com/radio", ""), "RADIO");
        assert_eq!(detect_codec("https://stream.example.com/live", ""), "RADIO");
    }

    #[test]
    fn detect_codec_float_pipe_is_pcm() {
        assert_eq!(detect_codec("pipe:///tmp/snapfifo", "48000:f:2"), "PCM");
    }

    #[test]
    fn parse_audio_format_variants() {
        assert_eq!(parse_audio_format("44100:16:2"), (44100, 16));
        assert_eq!(parse_audio_format("48000:f:2"), (48000, 32));
        assert_eq!(parse_audio_format("192000:24:2"), (192000, 24));
        assert_eq!(parse_audio_format(""), (0, 0));
        assert_eq!(parse_audio_format("44100"), (0, 0));
    }

    #[test]
    fn split_stream_title_conventional() {
        assert_eq!(
            split_stream_title("Boards of Canada - Roygbiv"),
            Some(("Boards of Canada".into(), "Roygbiv".into()))
        );
        assert_eq!(split_stream_title("just a title"), None);
        assert_eq!(split_stream_title(" - "), None);
    }
}
