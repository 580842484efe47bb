//! Minimal MPD text-protocol client.
//!
//! Used two ways: as the metadata fallback when the playback server's stream
//! properties are empty (`currentsong` / `status`), and for embedded album
//! art extraction (`readpicture`).  One connection, guarded by a mutex so
//! the poll loop and artwork fetches never interleave commands.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

/// Hard cap on embedded picture size.
pub const MAX_PICTURE_BYTES: usize = 10 * 1024 * 1024;

const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Quote a value for use as an MPD command argument.  Control characters are
/// rejected outright; stream titles are untrusted and must never be able to
/// smuggle a second command or break out of the quoting.
pub fn quote_arg(value: &str) -> Result<String> {
    if value.contains(['\n', '\r', '\t', '\0']) {
        bail!("control character in MPD argument");
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{}\"", escaped))
}

/// Parse `key: value` response lines into pairs, stopping at OK/ACK.
pub fn parse_response_pairs(response: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in response.lines() {
        if line == "OK" || line.starts_with("ACK") {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            pairs.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }
    pairs
}

pub struct MpdClient {
    addr: String,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl MpdClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<BufReader<TcpStream>> {
        let stream = tokio::time::timeout(IO_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .context("MPD connect timed out")??;
        let mut reader = BufReader::new(stream);

        // greeting: "OK MPD <version>\n"
        let mut greeting = [0u8; 64];
        let n = tokio::time::timeout(IO_TIMEOUT, reader.read(&mut greeting))
            .await
            .context("MPD greeting timed out")??;
        if !greeting[..n].starts_with(b"OK MPD") {
            bail!("unexpected MPD greeting");
        }
        Ok(reader)
    }

    /// Run a text command and return its raw response (up to and including
    /// the OK/ACK terminator line).
    pub async fn command(&self, cmd: &str) -> Result<String> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().context("MPD connection missing")?;

        let result = Self::exec_text(conn, cmd).await;
        if result.is_err() {
            // drop the connection so the next call reconnects
            *guard = None;
        }
        result
    }

    async fn exec_text(conn: &mut BufReader<TcpStream>, cmd: &str) -> Result<String> {
        conn.get_mut()
            .write_all(format!("{}\n", cmd).as_bytes())
            .await?;

        let mut response = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = tokio::time::timeout(IO_TIMEOUT, conn.read(&mut chunk))
                .await
                .context("MPD read timed out")??;
            if n == 0 {
                break; // connection closed, return what we have
            }
            response.extend_from_slice(&chunk[..n]);
            if response.ends_with(b"OK\n") || response_has_ack(&response) {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    /// Fetch the current song and player status as key/value pairs.
    pub async fn current_song(&self) -> Result<Vec<(String, String)>> {
        let song = self.command("currentsong").await?;
        let status = self.command("status").await?;
        let mut pairs = parse_response_pairs(&song);
        pairs.extend(parse_response_pairs(&status));
        Ok(pairs)
    }

    /// Fetch the picture embedded in `uri`'s tags via `readpicture`,
    /// following MPD's chunked binary protocol.  Returns None when the file
    /// has no embedded art.
    pub async fn read_picture(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        let quoted = quote_arg(uri)?;
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let conn = guard.as_mut().context("MPD connection missing")?;

        let mut picture: Vec<u8> = Vec::new();
        loop {
            let cmd = format!("readpicture {} {}\n", quoted, picture.len());
            if let Err(e) = conn.get_mut().write_all(cmd.as_bytes()).await {
                *guard = None;
                return Err(e.into());
            }

            match Self::read_binary_chunk(conn).await {
                Ok(Some((total, chunk))) => {
                    if total > MAX_PICTURE_BYTES {
                        *guard = None; // abandon mid-transfer state
                        bail!("embedded picture exceeds {} bytes", MAX_PICTURE_BYTES);
                    }
                    picture.extend_from_slice(&chunk);
                    if picture.len() >= total {
                        debug!("readpicture complete: {} bytes", picture.len());
                        return Ok(Some(picture));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => {
                    *guard = None;
                    return Err(e);
                }
            }
        }
    }

    /// Read one `size:/binary:` header + payload chunk.  Returns
    /// `Some((total_size, bytes))`, or None when MPD answers ACK (no
    /// picture).
    async fn read_binary_chunk(
        conn: &mut BufReader<TcpStream>,
    ) -> Result<Option<(usize, Vec<u8>)>> {
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 4096];

        // read header lines until we know the binary length
        let (total, binary_len, header_end) = loop {
            let n = tokio::time::timeout(IO_TIMEOUT, conn.read(&mut chunk))
                .await
                .context("MPD binary read timed out")??;
            if n == 0 {
                bail!("MPD closed during readpicture");
            }
            buf.extend_from_slice(&chunk[..n]);

            if response_has_ack(&buf) {
                return Ok(None);
            }
            if let Some(parsed) = parse_binary_header(&buf) {
                break parsed;
            }
            if buf.len() > 8192 {
                bail!("unparseable readpicture header");
            }
        };

        // read the payload (+ trailing "\nOK\n")
        let want = header_end + binary_len;
        while buf.len() < want {
            let n = tokio::time::timeout(IO_TIMEOUT, conn.read(&mut chunk))
                .await
                .context("MPD binary read timed out")??;
            if n == 0 {
                bail!("MPD closed mid-picture");
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        // drain the terminator if it is still in flight
        while !buf[want..].windows(3).any(|w| w == b"OK\n") {
            let n = tokio::time::timeout(IO_TIMEOUT, conn.read(&mut chunk))
                .await
                .context("MPD binary read timed out")??;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        Ok(Some((total, buf[header_end..want].to_vec())))
    }
}

fn response_has_ack(buf: &[u8]) -> bool {
    buf.starts_with(b"ACK") || buf.windows(4).any(|w| w == b"\nACK")
}

/// Parse `size: N\n... binary: M\n` headers; returns
/// `(total_size, binary_len, offset_of_payload)`.
fn parse_binary_header(buf: &[u8]) -> Option<(usize, usize, usize)> {
    let text_end = buf.windows(8).position(|w| w.starts_with(b"binary:"))?;
    let rest = &buf[text_end..];
    let line_end = rest.iter().position(|&b| b == b'\n')?;
    let header = std::str::from_utf8(&buf[..text_end + line_end]).ok()?;

    let mut total = None;
    let mut binary = None;
    for line in header.lines() {
        if let Some(v) = line.strip_prefix("size:") {
            total = v.trim().parse::<usize>().ok();
        } else if let Some(v) = line.strip_prefix("binary:") {
            binary = v.trim().parse::<usize>().ok();
        }
    }
    let binary = binary?;
    // single-chunk servers may omit size:
    let total = total.unwrap_or(binary);
    Some((total, binary, text_end + line_end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_backslash_and_quotes() {
        assert_eq!(quote_arg("plain.flac").unwrap(), "\"plain.flac\"");
        assert_eq!(
            quote_arg(r#"weird "name".flac"#).unwrap(),
            r#""weird \"name\".flac""#
        );
        assert_eq!(quote_arg(r"a\b").unwrap(), r#""a\\b""#);
    }

    #[test]
    fn quote_rejects_control_characters() {
        for bad in ["a\nb", "a\rb", "a\tb", "a\0b"] {
            assert!(quote_arg(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn parse_pairs_stops_at_ok() {
        let pairs = parse_response_pairs("Title: Ten\nArtist: Pearl Jam\nOK\nTitle: leak\n");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0], ("title".to_string(), "Ten".to_string()));
    }

    #[test]
    fn parse_pairs_stops_at_ack() {
        let pairs = parse_response_pairs("ACK [50@0] {play} No such song\nTitle: leak\n");
        assert!(pairs.is_empty());
    }

    #[test]
    fn binary_header_parses_both_fields() {
        let buf = b"size: 120000\ntype: image/jpeg\nbinary: 4096\n\xff\xd8rest";
        let (total, binary, offset) = parse_binary_header(buf).unwrap();
        assert_eq!(total, 120000);
        assert_eq!(binary, 4096);
        assert_eq!(&buf[offset..offset + 2], b"\xff\xd8");
    }

    #[test]
    fn binary_header_defaults_total_to_chunk() {
        let buf = b"type: image/png\nbinary: 10\n0123456789\nOK\n";
        let (total, binary, _) = parse_binary_header(buf).unwrap();
        assert_eq!(total, 10);
        assert_eq!(binary, 10);
    }

    #[test]
    fn ack_detection() {
        assert!(response_has_ack(b"ACK [5@0] {readpicture} no file"));
        assert!(response_has_ack(b"foo\nACK bar"));
        assert!(!response_has_ack(b"size: 10\nbinary: 10\n"));
    }
}
