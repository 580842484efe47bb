use std::sync::Arc;

use panel_proto::track::TrackState;
use tokio::sync::RwLock;

/// Owner of the one mutable TrackState.  Every mutation replaces the whole
/// snapshot and bumps `rev`; readers only ever clone complete snapshots.
pub struct StateManager {
    state: Arc<RwLock<TrackState>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(TrackState {
                rev: 1,
                ..TrackState::unknown()
            })),
        }
    }

    pub async fn snapshot(&self) -> TrackState {
        self.state.read().await.clone()
    }

    /// Replace the track fields with a freshly built snapshot.  Returns the
    /// new revision if anything actually changed, None otherwise; callers
    /// broadcast only on Some.
    pub async fn replace(&self, mut next: TrackState) -> Option<u64> {
        next.clamp_timeline();
        let mut state = self.state.write().await;

        // carry artwork bookkeeping across non-identity updates
        if next.identity() == state.identity() {
            next.art_available = state.art_available;
            next.art_rev = state.art_rev;
        }

        next.rev = state.rev;
        if next == *state {
            return None;
        }
        next.rev = state.rev + 1;
        *state = next;
        Some(state.rev)
    }

    /// Clear to the unknown sentinel (control connection lost).
    pub async fn clear(&self) -> Option<u64> {
        self.replace(TrackState::unknown()).await
    }

    /// Mark artwork bytes as (un)available for the current track.
    pub async fn set_art_available(&self, identity: &str, available: bool) -> Option<u64> {
        let mut state = self.state.write().await;
        if state.identity() != identity {
            return None; // track changed while we were fetching
        }
        if state.art_available == available {
            return None;
        }
        state.art_available = available;
        state.art_rev += 1;
        state.rev += 1;
        Some(state.rev)
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_proto::track::PlaybackStatus;

    #[tokio::test]
    async fn replace_bumps_rev_only_on_change() {
        let sm = StateManager::new();
        let track = TrackState {
            title: "Ten".into(),
            artist: "Pearl Jam".into(),
            playback_status: PlaybackStatus::Playing,
            ..Default::default()
        };
        let rev = sm.replace(track.clone()).await;
        assert!(rev.is_some());
        // identical snapshot: no new revision, no broadcast
        assert_eq!(sm.replace(track).await, None);
    }

    #[tokio::test]
    async fn replace_enforces_timeline_invariant() {
        let sm = StateManager::new();
        let track = TrackState {
            title: "x".into(),
            position: 400.0,
            duration: 100.0,
            ..Default::default()
        };
        sm.replace(track).await;
        let snap = sm.snapshot().await;
        assert!(snap.position <= snap.duration);
    }

    #[tokio::test]
    async fn art_flag_survives_position_updates() {
        let sm = StateManager::new();
        let mut track = TrackState {
            title: "x".into(),
            artist: "y".into(),
            ..Default::default()
        };
        sm.replace(track.clone()).await;
        let id = sm.snapshot().await.identity();
        assert!(sm.set_art_available(&id, true).await.is_some());

        track.position = 12.0;
        sm.replace(track).await;
        assert!(sm.snapshot().await.art_available);
    }

    #[tokio::test]
    async fn art_flag_resets_on_identity_change() {
        let sm = StateManager::new();
        let track = TrackState {
            title: "a".into(),
            ..Default::default()
        };
        sm.replace(track).await;
        let id = sm.snapshot().await.identity();
        sm.set_art_available(&id, true).await;

        let other = TrackState {
            title: "b".into(),
            ..Default::default()
        };
        sm.replace(other).await;
        assert!(!sm.snapshot().await.art_available);
        // stale fetch completion for the old track must not flip the flag
        assert_eq!(sm.set_art_available(&id, true).await, None);
    }
}
