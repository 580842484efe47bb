use serde::{Deserialize, Serialize};

use crate::bands::{BandMode, SpectrumFrame};
use crate::track::TrackState;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way; clients check it in the spectrum hello / track push.
pub const PROTOCOL_VERSION: u32 = 1;

/// WebSocket close code used when a subscriber cap is exceeded.
/// 4000-4999 is the application range of RFC 6455.
pub const CLOSE_SUBSCRIBER_LIMIT: u16 = 4001;
pub const CLOSE_REASON_TOTAL: &str = "subscriber limit reached";
pub const CLOSE_REASON_PER_IP: &str = "per-ip subscriber limit reached";

/// Messages pushed by the metadata bridge to display clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum BridgeEvent {
    /// Sent on connect and on every state change: the full track snapshot.
    Track {
        protocol_version: u32,
        state: TrackState,
    },
}

/// Messages pushed by the spectrum analyzer to display clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SpectrumEvent {
    /// First message of every session.  The band count declared here is
    /// fixed for the lifetime of the connection.
    Hello {
        protocol_version: u32,
        mode: BandMode,
        band_count: usize,
    },
    Frame(SpectrumFrame),
}

impl BridgeEvent {
    pub fn track(state: TrackState) -> Self {
        BridgeEvent::Track {
            protocol_version: PROTOCOL_VERSION,
            state,
        }
    }
}

impl SpectrumEvent {
    pub fn hello(mode: BandMode) -> Self {
        SpectrumEvent::Hello {
            protocol_version: PROTOCOL_VERSION,
            mode,
            band_count: mode.band_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_event_round_trips() {
        let state = TrackState {
            rev: 7,
            title: "Roygbiv".into(),
            ..Default::default()
        };
        let json = serde_json::to_string(&BridgeEvent::track(state)).unwrap();
        assert!(json.contains("\"event\":\"track\""));
        let back: BridgeEvent = serde_json::from_str(&json).unwrap();
        let BridgeEvent::Track { state, .. } = back;
        assert_eq!(state.rev, 7);
        assert_eq!(state.title, "Roygbiv");
    }

    #[test]
    fn hello_declares_band_count() {
        let json = serde_json::to_string(&SpectrumEvent::hello(BandMode::ThirdOctave)).unwrap();
        let back: SpectrumEvent = serde_json::from_str(&json).unwrap();
        match back {
            SpectrumEvent::Hello {
                mode, band_count, ..
            } => {
                assert_eq!(mode, BandMode::ThirdOctave);
                assert_eq!(band_count, 31);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn frame_event_keeps_band_invariant() {
        let frame = SpectrumFrame::silent(BandMode::HalfOctave);
        let json = serde_json::to_string(&SpectrumEvent::Frame(frame)).unwrap();
        let back: SpectrumEvent = serde_json::from_str(&json).unwrap();
        match back {
            SpectrumEvent::Frame(f) => assert_eq!(f.bands.len(), f.mode.band_count()),
            _ => panic!("wrong message type"),
        }
    }
}
