//! Artwork resolution: an ordered chain of sources sharing one capability
//! interface, a bounded identity-keyed memory cache backed by a bounded
//! on-disk cache, and the store the HTTP endpoint serves bytes from.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use panel_proto::track::TrackState;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Total transfer budget for any single outbound artwork fetch.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Identity cache size: enough for a listening session's worth of
/// back-and-forth skipping without unbounded growth.
const CACHE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtSource {
    Embedded,
    Itunes,
    MusicBrainz,
    RadioBrowser,
    /// Served from the on-disk cache, originally fetched by one of the above.
    Cached,
}

#[derive(Debug, Clone)]
pub struct ArtworkAsset {
    pub source: ArtSource,
    pub bytes: Arc<Vec<u8>>,
    pub mime: &'static str,
    pub fetched_at: Instant,
    pub cache_key: String,
}

/// Sniff the image format from magic bytes.  Anything unrecognised is
/// rejected; we never serve attacker-controlled bytes under an image
/// content type without checking them.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}

/// One artwork source.  Returning Ok(None) means "nothing here, try the
/// next source"; errors are logged by the chain and treated the same way.
pub trait ArtworkSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve<'a>(&'a self, track: &'a TrackState) -> BoxFuture<'a, Result<Option<ArtworkAsset>>>;
}

/// Ordered resolver chain with a bounded negative-result-caching store.
pub struct ArtworkResolver {
    sources: Vec<Box<dyn ArtworkSource>>,
    // identity -> resolved asset (None caches a failed lookup so a track
    // that has no art anywhere is not re-fetched every poll)
    cache: HashMap<String, Option<ArtworkAsset>>,
    order: VecDeque<String>,
    disk: Option<DiskCache>,
}

impl ArtworkResolver {
    pub fn new(sources: Vec<Box<dyn ArtworkSource>>) -> Self {
        Self {
            sources,
            cache: HashMap::new(),
            order: VecDeque::new(),
            disk: None,
        }
    }

    /// Persist resolved assets under `dir` and consult them before the
    /// chain, so a restart does not re-fetch everything.
    pub fn with_disk_cache(mut self, dir: PathBuf) -> Self {
        self.disk = Some(DiskCache::new(dir));
        self
    }

    /// Try the caches, then each source in priority order until one yields
    /// an asset.  A fully exhausted chain returns None and the renderer
    /// falls back to its placeholder.
    pub async fn resolve(&mut self, track: &TrackState) -> Option<ArtworkAsset> {
        let key = track.identity();
        if let Some(cached) = self.cache.get(&key) {
            debug!("artwork cache hit for {:?}", key);
            return cached.clone();
        }
        if let Some(disk) = &self.disk {
            if let Some(asset) = disk.load(&key).await {
                debug!("artwork disk cache hit for {:?}", key);
                self.insert(key, Some(asset.clone()));
                return Some(asset);
            }
        }

        let mut found = None;
        for source in &self.sources {
            match source.resolve(track).await {
                Ok(Some(asset)) => {
                    info!(
                        "artwork from {} for {:?} ({} bytes, {})",
                        source.name(),
                        key,
                        asset.bytes.len(),
                        asset.mime
                    );
                    found = Some(asset);
                    break;
                }
                Ok(None) => {
                    debug!("artwork source {} had nothing for {:?}", source.name(), key);
                }
                Err(e) => {
                    // fall through to the next source
                    warn!("artwork source {} failed for {:?}: {:#}", source.name(), key, e);
                }
            }
        }

        if let (Some(disk), Some(asset)) = (&self.disk, &found) {
            match disk.store(&key, &asset.bytes).await {
                Ok(path) => debug!("artwork cached at {:?}", path),
                Err(e) => warn!("artwork cache write failed: {:#}", e),
            }
        }

        self.insert(key, found.clone());
        found
    }

    fn insert(&mut self, key: String, asset: Option<ArtworkAsset>) {
        if self.cache.len() >= CACHE_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.cache.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.cache.insert(key, asset);
    }
}

/// The asset currently served by `GET /artwork`, shared between the
/// resolver task and the HTTP server.
#[derive(Default, Clone)]
pub struct ArtworkStore {
    current: Arc<RwLock<Option<ArtworkAsset>>>,
}

impl ArtworkStore {
    pub async fn set(&self, asset: Option<ArtworkAsset>) {
        *self.current.write().await = asset;
    }

    pub async fn get(&self) -> Option<ArtworkAsset> {
        self.current.read().await.clone()
    }
}

/// On-disk artwork cache keyed by track identity.  Entries survive
/// restarts; the directory is pruned to the same capacity as the memory
/// cache so storage-tight devices never fill up.
pub struct DiskCache {
    dir: PathBuf,
}

impl DiskCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, identity: &str) -> PathBuf {
        self.dir.join(format!("{:016x}.img", identity_hash(identity)))
    }

    /// Load a cached image, re-sniffing the bytes; a corrupt or truncated
    /// file reads as a miss.
    pub async fn load(&self, identity: &str) -> Option<ArtworkAsset> {
        let bytes = tokio::fs::read(self.path_for(identity)).await.ok()?;
        let mime = sniff_mime(&bytes)?;
        Some(ArtworkAsset {
            source: ArtSource::Cached,
            bytes: Arc::new(bytes),
            mime,
            fetched_at: Instant::now(),
            cache_key: identity.to_string(),
        })
    }

    pub async fn store(&self, identity: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = write_cache_file(&self.dir, identity_hash(identity), bytes).await?;
        self.prune().await;
        Ok(path)
    }

    /// Drop the oldest images once the directory exceeds capacity.
    async fn prune(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        let mut images = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().extension().map_or(false, |e| e == "img") {
                let modified = entry.metadata().await.ok().and_then(|m| m.modified().ok());
                images.push((modified, entry.path()));
            }
        }
        if images.len() <= CACHE_CAPACITY {
            return;
        }
        images.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, path) in images.iter().take(images.len() - CACHE_CAPACITY) {
            let _ = tokio::fs::remove_file(path).await;
        }
    }
}

/// Atomically persist artwork bytes: write to a temp file in the same
/// directory, then rename over the destination so a concurrent reader never
/// observes a partial image.
pub async fn write_cache_file(dir: &PathBuf, key_hash: u64, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let dest = dir.join(format!("{:016x}.img", key_hash));
    let tmp = dir.join(format!(".{:016x}.tmp", key_hash));
    tokio::fs::write(&tmp, bytes)
        .await
        .context("writing artwork temp file")?;
    tokio::fs::rename(&tmp, &dest)
        .await
        .context("committing artwork cache file")?;
    Ok(dest)
}

pub fn identity_hash(identity: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    identity.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        name: &'static str,
        asset: Option<ArtworkAsset>,
        fail: bool,
        calls: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn hit(name: &'static str, calls: Arc<AtomicUsize>) -> Self {
            let asset = ArtworkAsset {
                source: ArtSource::Itunes,
                bytes: Arc::new(vec![0xFF, 0xD8, 0xFF, 0xE0]),
                mime: "image/jpeg",
                fetched_at: Instant::now(),
                cache_key: "k".into(),
            };
            Self {
                name,
                asset: Some(asset),
                fail: false,
                calls,
            }
        }

        fn miss(name: &'static str, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name,
                asset: None,
                fail: false,
                calls,
            }
        }

        fn broken(name: &'static str, calls: Arc<AtomicUsize>) -> Self {
            Self {
                name,
                asset: None,
                fail: true,
                calls,
            }
        }
    }

    impl ArtworkSource for FakeSource {
        fn name(&self) -> &'static str {
            self.name
        }

        fn resolve<'a>(
            &'a self,
            _track: &'a TrackState,
        ) -> BoxFuture<'a, Result<Option<ArtworkAsset>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if self.fail {
                    anyhow::bail!("boom");
                }
                Ok(self.asset.clone())
            })
        }
    }

    fn track(title: &str) -> TrackState {
        TrackState {
            title: title.into(),
            artist: "a".into(),
            album: "b".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn chain_falls_through_misses_and_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver = ArtworkResolver::new(vec![
            Box::new(FakeSource::miss("embedded", calls.clone())),
            Box::new(FakeSource::broken("itunes", calls.clone())),
            Box::new(FakeSource::hit("musicbrainz", calls.clone())),
        ]);
        let asset = resolver.resolve(&track("t")).await;
        assert!(asset.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unchanged_identity_is_a_cache_hit() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver =
            ArtworkResolver::new(vec![Box::new(FakeSource::hit("itunes", calls.clone()))]);
        let t = track("same");
        resolver.resolve(&t).await;
        resolver.resolve(&t).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second resolve must not re-fetch");
    }

    #[tokio::test]
    async fn exhausted_chain_caches_the_negative_result() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver =
            ArtworkResolver::new(vec![Box::new(FakeSource::miss("itunes", calls.clone()))]);
        let t = track("none");
        assert!(resolver.resolve(&t).await.is_none());
        assert!(resolver.resolve(&t).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sniff_recognises_the_four_formats() {
        assert_eq!(sniff_mime(&[0xFF, 0xD8, 0xFF, 0xE1, 0x00]), Some("image/jpeg"));
        assert_eq!(sniff_mime(b"\x89PNG\r\n\x1a\n...."), Some("image/png"));
        assert_eq!(sniff_mime(b"GIF89a......"), Some("image/gif"));
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00WEBPVP8 "), Some("image/webp"));
        assert_eq!(sniff_mime(b"<html>not an image"), None);
        assert_eq!(sniff_mime(b""), None);
    }

    #[tokio::test]
    async fn disk_cache_warms_a_fresh_resolver() {
        let dir = std::env::temp_dir().join(format!("art-disk-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let t = track("restart");

        let disk = DiskCache::new(dir.clone());
        disk.store(&t.identity(), &[0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3])
            .await
            .unwrap();

        // a resolver whose chain finds nothing still serves the disk copy
        let calls = Arc::new(AtomicUsize::new(0));
        let mut resolver =
            ArtworkResolver::new(vec![Box::new(FakeSource::miss("itunes", calls.clone()))])
                .with_disk_cache(dir.clone());

        let asset = resolver.resolve(&t).await.expect("disk copy expected");
        assert_eq!(asset.source, ArtSource::Cached);
        assert_eq!(asset.mime, "image/jpeg");
        assert_eq!(calls.load(Ordering::SeqCst), 0, "chain must not be consulted");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn disk_cache_prunes_oldest_beyond_capacity() {
        let dir = std::env::temp_dir().join(format!("art-prune-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let disk = DiskCache::new(dir.clone());

        for i in 0..CACHE_CAPACITY + 8 {
            disk.store(&format!("track-{}", i), b"\xff\xd8\xffpayload")
                .await
                .unwrap();
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            if entry.path().extension().map_or(false, |e| e == "img") {
                count += 1;
            }
        }
        assert!(count <= CACHE_CAPACITY, "cache dir holds {} images", count);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn cache_file_write_is_atomic_rename() {
        let dir = std::env::temp_dir().join(format!("art-test-{}", std::process::id()));
        let path = write_cache_file(&dir, 0xabcd, b"\xff\xd8\xffdata").await.unwrap();
        let read = tokio::fs::read(&path).await.unwrap();
        assert_eq!(read, b"\xff\xd8\xffdata");
        // no temp file left behind
        assert!(!dir.join(".000000000000abcd.tmp").exists());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
