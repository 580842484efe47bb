//! Outbound URL hardening for the artwork fetchers.
//!
//! Every artwork URL that did not come from our own configuration is
//! attacker-influenced (stream titles, search-API responses), so before any
//! fetch we resolve the host and refuse anything that lands on a private,
//! loopback or link-local address.  The playback server's own host is
//! exempt: first-party artwork legitimately lives there.

use std::net::{IpAddr, Ipv6Addr};

use reqwest::Url;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SsrfError {
    #[error("unsupported url scheme {0:?}")]
    Scheme(String),
    #[error("url has no host")]
    NoHost,
    #[error("hostname did not resolve")]
    Unresolvable,
    #[error("address {0} is not publicly routable")]
    ForbiddenAddress(IpAddr),
}

/// Validate an artwork URL before fetching.  `exempt_host` is the configured
/// playback server.
pub async fn check_url(url: &Url, exempt_host: &str) -> Result<(), SsrfError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(SsrfError::Scheme(other.to_string())),
    }

    let host = url.host_str().ok_or(SsrfError::NoHost)?;
    if host.eq_ignore_ascii_case(exempt_host) {
        return Ok(());
    }

    // Literal IP hosts skip DNS entirely.
    if let Ok(ip) = host.trim_matches(['[', ']']).parse::<IpAddr>() {
        return check_addr(ip);
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let mut resolved = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| SsrfError::Unresolvable)?
        .peekable();
    if resolved.peek().is_none() {
        return Err(SsrfError::Unresolvable);
    }
    for addr in resolved {
        check_addr(addr.ip())?;
    }
    Ok(())
}

/// Reject private, loopback, link-local and otherwise non-routable
/// addresses under both IPv4 and IPv6 rules.
pub fn check_addr(ip: IpAddr) -> Result<(), SsrfError> {
    let forbidden = match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            // check the embedded v4 address of mapped forms
            if let Some(v4) = v6.to_ipv4_mapped() {
                return check_addr(IpAddr::V4(v4));
            }
            v6.is_loopback() || v6.is_unspecified() || is_link_local_v6(&v6) || is_unique_local_v6(&v6)
        }
    };
    if forbidden {
        Err(SsrfError::ForbiddenAddress(ip))
    } else {
        Ok(())
    }
}

// fe80::/10 (std's is_unicast_link_local is not stable yet)
fn is_link_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xffc0) == 0xfe80
}

// fc00::/7
fn is_unique_local_v6(v6: &Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn rejects_loopback_and_private_v4() {
        assert!(check_addr(ip("127.0.0.1")).is_err());
        assert!(check_addr(ip("10.0.0.5")).is_err());
        assert!(check_addr(ip("192.168.1.10")).is_err());
        assert!(check_addr(ip("169.254.0.7")).is_err());
        assert!(check_addr(ip("0.0.0.0")).is_err());
    }

    #[test]
    fn rejects_local_v6() {
        assert!(check_addr(ip("::1")).is_err());
        assert!(check_addr(ip("fe80::1")).is_err());
        assert!(check_addr(ip("fd12:3456::1")).is_err());
        assert!(check_addr(ip("::ffff:127.0.0.1")).is_err());
    }

    #[test]
    fn accepts_public_addresses() {
        assert!(check_addr(ip("93.184.216.34")).is_ok());
        assert!(check_addr(ip("2606:2800:220:1::1")).is_ok());
    }

    #[tokio::test]
    async fn rejects_non_http_schemes() {
        let url = Url::parse("ftp://example.com/cover.jpg").unwrap();
        assert_eq!(
            check_url(&url, "snapserver.local").await,
            Err(SsrfError::Scheme("ftp".into()))
        );
        let url = Url::parse("file:///etc/passwd").unwrap();
        assert!(check_url(&url, "snapserver.local").await.is_err());
    }

    #[tokio::test]
    async fn exempts_the_playback_server_host() {
        // would otherwise be unresolvable or private in most environments
        let url = Url::parse("http://snapserver.local/art/cover.jpg").unwrap();
        assert!(check_url(&url, "snapserver.local").await.is_ok());
    }

    #[tokio::test]
    async fn literal_private_ip_urls_are_rejected() {
        for bad in [
            "http://127.0.0.1/x.png",
            "http://10.0.0.5/x.png",
            "http://[fe80::1]/x.png",
        ] {
            let url = Url::parse(bad).unwrap();
            assert!(
                check_url(&url, "snapserver.local").await.is_err(),
                "{bad} should be blocked"
            );
        }
    }
}
