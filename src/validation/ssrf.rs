//! Connect-time SSRF defense.
//!
//! Admission only proves a URL looked safe once; DNS answers can change
//! between admission and navigation (rebinding). The crawler therefore calls
//! [`validate_host_for_connect`] with a fresh resolution before every page
//! load, and rejects the page if ANY resolved address is private or
//! reserved.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use tracing::debug;
use url::Url;

use super::ValidationError;

/// Whether an address must never be dialed by the crawler.
///
/// Covers loopback, link-local, RFC1918, the zero network, IPv6 loopback /
/// unspecified / unique-local / link-local, and IPv4-mapped forms of all of
/// the above.
#[must_use]
pub fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => ipv4_private_or_reserved(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return ipv4_private_or_reserved(mapped);
            }
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local_v6(v6)
                || is_link_local_v6(v6)
        }
    }
}

fn ipv4_private_or_reserved(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_loopback()                                  // 127.0.0.0/8
        || ip.is_private()                            // 10/8, 172.16/12, 192.168/16
        || ip.is_link_local()                         // 169.254.0.0/16
        || octets[0] == 0 // 0.0.0.0/8
}

// fc00::/7
fn is_unique_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

// fe80::/10
fn is_link_local_v6(ip: Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Resolve `host` fresh and fail if any answer lands in a blocked range.
///
/// The port only disambiguates the resolver call; the verdict is purely
/// address-based. A host that fails to resolve at all is also rejected —
/// the crawler has nowhere safe to connect.
pub async fn validate_host_for_connect(host: &str, port: u16) -> Result<(), ValidationError> {
    // IP literals skip the resolver.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return if is_private_or_reserved(ip) {
            Err(ValidationError::UrlBlockedHost)
        } else {
            Ok(())
        };
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Err(ValidationError::UrlBlockedHost);
    }

    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|_| ValidationError::UrlBlockedHost)?;

    let mut saw_any = false;
    for addr in addrs {
        saw_any = true;
        if is_private_or_reserved(addr.ip()) {
            debug!(host, %addr, "rejecting host: resolution includes blocked address");
            return Err(ValidationError::UrlBlockedHost);
        }
    }

    if saw_any {
        Ok(())
    } else {
        Err(ValidationError::UrlBlockedHost)
    }
}

/// Connect-time host admission, taken by the crawl engine as a seam so tests
/// can script resolver behavior (including rebinding sequences).
#[async_trait]
pub trait HostCheck: Send + Sync {
    async fn check_url(&self, url: &Url) -> Result<(), ValidationError>;
}

/// Production [`HostCheck`] backed by the system resolver.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolvingHostCheck;

#[async_trait]
impl HostCheck for ResolvingHostCheck {
    async fn check_url(&self, url: &Url) -> Result<(), ValidationError> {
        let host = url.host_str().ok_or(ValidationError::UrlBlockedHost)?;
        let port = url.port_or_known_default().unwrap_or(443);
        validate_host_for_connect(host, port).await
    }
}
