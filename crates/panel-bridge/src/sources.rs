//! Concrete artwork sources, tried in priority order by the resolver chain:
//! embedded picture, iTunes search, MusicBrainz + Cover Art Archive, and
//! (radio only) a station-favicon lookup.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use futures_util::future::BoxFuture;
use panel_proto::track::{StreamKind, TrackState};
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::artwork::{sniff_mime, ArtSource, ArtworkAsset, ArtworkSource, FETCH_TIMEOUT};
use crate::mpd::MpdClient;
use crate::ssrf;

const USER_AGENT: &str = concat!("hifi-panel/", env!("CARGO_PKG_VERSION"));

/// Station names go into search URLs; cap them so a hostile stream title
/// cannot produce an absurd request.
const MAX_STATION_NAME: usize = 200;

/// Shared outbound HTTP plumbing: one client with the transfer timeout
/// baked in, plus the SSRF gate in front of every image download.
pub struct Fetcher {
    client: reqwest::Client,
    exempt_host: String,
}

impl Fetcher {
    pub fn new(exempt_host: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("building artwork HTTP client")?;
        Ok(Self {
            client,
            exempt_host: exempt_host.to_string(),
        })
    }

    /// GET a JSON document.  Search-API endpoints are fixed hosts we chose,
    /// but candidate URLs inside the responses are not, so those go through
    /// `fetch_image` instead.
    async fn fetch_json<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .context("artwork API request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("artwork API returned status {}", response.status());
        }
        response.json().await.context("parsing artwork API response")
    }

    /// Download image bytes from an untrusted URL: SSRF-check the host,
    /// then sniff the payload.  Unrecognised payloads are a miss, not an
    /// asset.
    async fn fetch_image(&self, raw_url: &str) -> Result<Option<(Vec<u8>, &'static str)>> {
        let url = Url::parse(raw_url).context("invalid artwork url")?;
        ssrf::check_url(&url, &self.exempt_host).await?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("artwork download failed")?;
        if !response.status().is_success() {
            anyhow::bail!("artwork download returned status {}", response.status());
        }
        let bytes = response
            .bytes()
            .await
            .context("reading artwork bytes")?
            .to_vec();
        Ok(sniff_mime(&bytes).map(|mime| (bytes, mime)))
    }
}

fn asset(source: ArtSource, bytes: Vec<u8>, mime: &'static str, track: &TrackState) -> ArtworkAsset {
    ArtworkAsset {
        source,
        bytes: Arc::new(bytes),
        mime,
        fetched_at: Instant::now(),
        cache_key: track.identity(),
    }
}

/// Priority 1: picture embedded in the file's own tags, pulled through the
/// music daemon's binary protocol.
pub struct EmbeddedSource {
    mpd: Arc<MpdClient>,
}

impl EmbeddedSource {
    pub fn new(mpd: Arc<MpdClient>) -> Self {
        Self { mpd }
    }
}

impl ArtworkSource for EmbeddedSource {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn resolve<'a>(&'a self, track: &'a TrackState) -> BoxFuture<'a, Result<Option<ArtworkAsset>>> {
        Box::pin(async move {
            // streams have no file to read tags from
            if track.stream_kind == StreamKind::Radio || track.file.is_empty() {
                return Ok(None);
            }
            let Some(bytes) = self.mpd.read_picture(&track.file).await? else {
                return Ok(None);
            };
            match sniff_mime(&bytes) {
                Some(mime) => Ok(Some(asset(ArtSource::Embedded, bytes, mime, track))),
                None => {
                    debug!("embedded picture in {:?} has unknown format", track.file);
                    Ok(None)
                }
            }
        })
    }
}

#[derive(Deserialize)]
struct ItunesResponse {
    #[serde(default)]
    results: Vec<ItunesResult>,
}

#[derive(Deserialize)]
struct ItunesResult {
    #[serde(rename = "collectionName", default)]
    collection_name: String,
    #[serde(rename = "artistName", default)]
    artist_name: String,
    #[serde(rename = "artworkUrl100", default)]
    artwork_url_100: String,
}

/// Priority 2: iTunes search.  Requests the top 10 candidates and accepts
/// only an exact album+artist match; the first hit for a generic album
/// title is frequently a different record entirely.
pub struct ItunesSource {
    fetcher: Arc<Fetcher>,
    endpoint: String,
}

impl ItunesSource {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self {
            fetcher,
            endpoint: "https://itunes.apple.com/search".to_string(),
        }
    }

    /// Pick the candidate whose album and artist both match exactly
    /// (case-insensitive).  No match means no artwork from this source.
    fn exact_match<'r>(
        results: &'r [ItunesResult],
        artist: &str,
        album: &str,
    ) -> Option<&'r ItunesResult> {
        results.iter().find(|r| {
            r.collection_name.eq_ignore_ascii_case(album)
                && r.artist_name.eq_ignore_ascii_case(artist)
                && !r.artwork_url_100.is_empty()
        })
    }
}

/// iTunes serves 100x100 thumbnails by default; the same path with the size
/// swapped serves the 600x600 original.
fn upgrade_itunes_url(url: &str) -> String {
    url.replace("100x100", "600x600")
}

impl ArtworkSource for ItunesSource {
    fn name(&self) -> &'static str {
        "itunes"
    }

    fn resolve<'a>(&'a self, track: &'a TrackState) -> BoxFuture<'a, Result<Option<ArtworkAsset>>> {
        Box::pin(async move {
            if track.artist.is_empty() || track.album.is_empty() {
                return Ok(None);
            }
            let term = format!("{} {}", track.artist, track.album);
            let url = format!(
                "{}?term={}&media=music&entity=album&limit=10",
                self.endpoint,
                urlencode(&term)
            );
            let response: ItunesResponse = self.fetcher.fetch_json(&url).await?;

            let Some(hit) = Self::exact_match(&response.results, &track.artist, &track.album)
            else {
                debug!(
                    "no exact iTunes match for {:?} / {:?} ({} candidates)",
                    track.artist,
                    track.album,
                    response.results.len()
                );
                return Ok(None);
            };

            let art_url = upgrade_itunes_url(&hit.artwork_url_100);
            match self.fetcher.fetch_image(&art_url).await? {
                Some((bytes, mime)) => Ok(Some(asset(ArtSource::Itunes, bytes, mime, track))),
                None => Ok(None),
            }
        })
    }
}

#[derive(Deserialize)]
struct MusicBrainzResponse {
    #[serde(default)]
    releases: Vec<MusicBrainzRelease>,
}

#[derive(Deserialize)]
struct MusicBrainzRelease {
    #[serde(default)]
    id: String,
}

/// Priority 3: MusicBrainz release search, then the Cover Art Archive front
/// image for the release id.
pub struct CoverArtSource {
    fetcher: Arc<Fetcher>,
}

impl CoverArtSource {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

impl ArtworkSource for CoverArtSource {
    fn name(&self) -> &'static str {
        "musicbrainz"
    }

    fn resolve<'a>(&'a self, track: &'a TrackState) -> BoxFuture<'a, Result<Option<ArtworkAsset>>> {
        Box::pin(async move {
            if track.artist.is_empty() || track.album.is_empty() {
                return Ok(None);
            }
            let query = format!(
                "artist:\"{}\" AND release:\"{}\"",
                track.artist, track.album
            );
            let url = format!(
                "https://musicbrainz.org/ws/2/release/?query={}&fmt=json&limit=1",
                urlencode(&query)
            );
            let response: MusicBrainzResponse = self.fetcher.fetch_json(&url).await?;

            let Some(release) = response.releases.first().filter(|r| !r.id.is_empty()) else {
                return Ok(None);
            };

            // CAA redirects to the actual image host
            let art_url = format!("https://coverartarchive.org/release/{}/front-500", release.id);
            match self.fetcher.fetch_image(&art_url).await? {
                Some((bytes, mime)) => Ok(Some(asset(ArtSource::MusicBrainz, bytes, mime, track))),
                None => Ok(None),
            }
        })
    }
}

#[derive(Deserialize)]
struct RadioBrowserStation {
    #[serde(default)]
    favicon: String,
}

/// Priority 4, radio streams only: look the station up by name in the
/// radio-browser directory and use its favicon.
pub struct RadioBrowserSource {
    fetcher: Arc<Fetcher>,
}

impl RadioBrowserSource {
    pub fn new(fetcher: Arc<Fetcher>) -> Self {
        Self { fetcher }
    }
}

impl ArtworkSource for RadioBrowserSource {
    fn name(&self) -> &'static str {
        "radio-browser"
    }

    fn resolve<'a>(&'a self, track: &'a TrackState) -> BoxFuture<'a, Result<Option<ArtworkAsset>>> {
        Box::pin(async move {
            if track.stream_kind != StreamKind::Radio {
                return Ok(None);
            }
            // radio streams carry the station name in the album slot when
            // the icy name is known, otherwise fall back to the artist
            let name = if !track.album.is_empty() {
                &track.album
            } else if !track.artist.is_empty() {
                &track.artist
            } else {
                return Ok(None);
            };
            let name = cap_station_name(name);

            let url = format!(
                "https://de1.api.radio-browser.info/json/stations/byname/{}?limit=1",
                urlencode(name)
            );
            let stations: Vec<RadioBrowserStation> = self.fetcher.fetch_json(&url).await?;
            let Some(favicon) = stations
                .first()
                .map(|s| s.favicon.as_str())
                .filter(|f| !f.is_empty())
            else {
                return Ok(None);
            };

            match self.fetcher.fetch_image(favicon).await? {
                Some((bytes, mime)) => Ok(Some(asset(ArtSource::RadioBrowser, bytes, mime, track))),
                None => Ok(None),
            }
        })
    }
}

fn cap_station_name(name: &str) -> &str {
    if name.len() <= MAX_STATION_NAME {
        return name;
    }
    // cut on a char boundary at or below the cap
    let mut end = MAX_STATION_NAME;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// Minimal percent-encoding for query values.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push_str("%20"),
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

/// Build the full chain in priority order for the resolver.
pub fn default_chain(mpd: Arc<MpdClient>, exempt_host: &str) -> Result<Vec<Box<dyn ArtworkSource>>> {
    let fetcher = Arc::new(Fetcher::new(exempt_host)?);
    Ok(vec![
        Box::new(EmbeddedSource::new(mpd)),
        Box::new(ItunesSource::new(fetcher.clone())),
        Box::new(CoverArtSource::new(fetcher.clone())),
        Box::new(RadioBrowserSource::new(fetcher)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(album: &str, artist: &str, url: &str) -> ItunesResult {
        ItunesResult {
            collection_name: album.into(),
            artist_name: artist.into(),
            artwork_url_100: url.into(),
        }
    }

    #[test]
    fn itunes_rejects_near_matches() {
        // the "Ten" false-positive class: first hit is a different record
        // with the same generic title
        let results = vec![
            result("Ten", "Girls Aloud", "http://a/100x100bb.jpg"),
            result("Ten", "Pearl Jam", "http://b/100x100bb.jpg"),
        ];
        let hit = ItunesSource::exact_match(&results, "Pearl Jam", "Ten").unwrap();
        assert_eq!(hit.artwork_url_100, "http://b/100x100bb.jpg");
    }

    #[test]
    fn itunes_no_exact_match_is_a_miss() {
        let results = vec![result("MTV Unplugged", "Some Band", "http://x/100x100bb.jpg")];
        assert!(ItunesSource::exact_match(&results, "Nirvana", "MTV Unplugged").is_none());
    }

    #[test]
    fn itunes_match_is_case_insensitive() {
        let results = vec![result("ten", "pearl jam", "http://b/100x100bb.jpg")];
        assert!(ItunesSource::exact_match(&results, "Pearl Jam", "Ten").is_some());
    }

    #[test]
    fn itunes_url_upgrade() {
        assert_eq!(
            upgrade_itunes_url("https://is1.mzstatic.com/image/thumb/x/100x100bb.jpg"),
            "https://is1.mzstatic.com/image/thumb/x/600x600bb.jpg"
        );
    }

    #[test]
    fn station_name_cap_respects_char_boundaries() {
        let long = "ü".repeat(150); // 300 bytes
        let capped = cap_station_name(&long);
        assert!(capped.len() <= MAX_STATION_NAME);
        assert!(capped.chars().all(|c| c == 'ü'));

        let short = "Radio Paradise";
        assert_eq!(cap_station_name(short), short);
    }

    #[test]
    fn urlencode_escapes_query_metacharacters() {
        assert_eq!(urlencode("Pearl Jam"), "Pearl%20Jam");
        assert_eq!(urlencode("a&b=c"), "a%26b%3Dc");
        assert_eq!(urlencode("artist:\"x\""), "artist%3A%22x%22");
    }
}
