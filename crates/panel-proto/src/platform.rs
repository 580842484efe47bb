use std::path::PathBuf;

/// Default port for the bridge HTTP/WebSocket server.
pub const BRIDGE_HTTP_PORT: u16 = 8080;

/// Default port for the spectrum WebSocket server.
pub const SPECTRUM_WS_PORT: u16 = 8081;

/// Default JSON-RPC control port on the playback server.
pub const CONTROL_PORT: u16 = 1705;

/// Default MPD text-protocol port on the playback server.
pub const MPD_PORT: u16 = 6600;

pub fn data_dir() -> PathBuf {
    // XDG layout on unix for consistency across macOS and Linux
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join("hifi-panel")
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hifi-panel")
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("hifi-panel")
    }
    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hifi-panel")
    }
}

pub fn cache_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".cache")
            .join("hifi-panel")
    }
    #[cfg(windows)]
    {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("hifi-panel")
    }
}
