use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::bands::BandMode;
use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub spectrum: SpectrumConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// The remote playback server: JSON-RPC control port plus the music daemon's
/// text-protocol port, both on the same host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    #[serde(default = "default_mpd_port")]
    pub mpd_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_bridge_port")]
    pub port: u16,
    /// Hard cap on concurrent WebSocket subscribers.
    #[serde(default = "default_max_subscribers")]
    pub max_subscribers: usize,
    /// Cap on concurrent subscribers per source IP.
    #[serde(default = "default_max_per_ip")]
    pub max_subscribers_per_ip: usize,
    /// Directory for the artwork byte cache (atomic temp-then-rename writes).
    #[serde(default = "default_artwork_cache_dir")]
    pub artwork_cache_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectrumConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_spectrum_port")]
    pub port: u16,
    /// Capture device name; None picks the default input.
    #[serde(default)]
    pub capture_device: Option<String>,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Fixed for the session; changing it requires a restart.
    #[serde(default)]
    pub band_mode: BandMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_fb_device")]
    pub fb_device: PathBuf,
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,
    #[serde(default = "default_spectrum_url")]
    pub spectrum_url: String,
    /// Fallback geometry when the fb sysfs entries are unreadable.
    #[serde(default = "default_resolution")]
    pub fallback_resolution: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            control_port: default_control_port(),
            mpd_port: default_mpd_port(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_bridge_port(),
            max_subscribers: default_max_subscribers(),
            max_subscribers_per_ip: default_max_per_ip(),
            artwork_cache_dir: default_artwork_cache_dir(),
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_spectrum_port(),
            capture_device: None,
            sample_rate: default_sample_rate(),
            band_mode: BandMode::default(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            fb_device: default_fb_device(),
            bridge_url: default_bridge_url(),
            spectrum_url: default_spectrum_url(),
            fallback_resolution: default_resolution(),
        }
    }
}

fn default_server_host() -> String {
    "snapserver.local".to_string()
}

fn default_control_port() -> u16 {
    platform::CONTROL_PORT
}

fn default_mpd_port() -> u16 {
    platform::MPD_PORT
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_bridge_port() -> u16 {
    platform::BRIDGE_HTTP_PORT
}

fn default_spectrum_port() -> u16 {
    platform::SPECTRUM_WS_PORT
}

fn default_max_subscribers() -> usize {
    16
}

fn default_max_per_ip() -> usize {
    4
}

fn default_artwork_cache_dir() -> PathBuf {
    platform::cache_dir().join("artwork")
}

fn default_sample_rate() -> u32 {
    44100
}

fn default_fb_device() -> PathBuf {
    PathBuf::from("/dev/fb0")
}

fn default_bridge_url() -> String {
    format!("http://127.0.0.1:{}", platform::BRIDGE_HTTP_PORT)
}

fn default_spectrum_url() -> String {
    format!("ws://127.0.0.1:{}/ws", platform::SPECTRUM_WS_PORT)
}

fn default_resolution() -> String {
    "1024x600".to_string()
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
