//! Link normalization and origin filtering.
//!
//! Two URLs are the same page when their normalized forms match: fragment
//! dropped, host lowercased (the parser already does this), default ports
//! stripped, and a trailing slash removed from non-root paths. Same-origin
//! means identical scheme, host, and effective port.

use url::Url;

/// Resolve `href` against `base` and normalize it for crawling. Returns
/// `None` for non-http(s) schemes and unparseable values.
#[must_use]
pub fn resolve_link(base: &Url, href: &str) -> Option<Url> {
    let trimmed = href.trim();
    if trimmed.is_empty()
        || trimmed.starts_with("javascript:")
        || trimmed.starts_with("mailto:")
        || trimmed.starts_with("tel:")
        || trimmed.starts_with("data:")
    {
        return None;
    }

    let mut resolved = base.join(trimmed).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);
    Some(resolved)
}

/// Canonical string form used for visited/pending membership.
#[must_use]
pub fn normalized(url: &Url) -> String {
    let mut out = String::with_capacity(url.as_str().len());
    out.push_str(url.scheme());
    out.push_str("://");
    if let Some(host) = url.host_str() {
        out.push_str(host);
    }
    if let Some(port) = url.port() {
        let default = match url.scheme() {
            "http" => 80,
            "https" => 443,
            _ => 0,
        };
        if port != default {
            out.push(':');
            out.push_str(&port.to_string());
        }
    }
    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        out.push_str(&path[..path.len() - 1]);
    } else if path.is_empty() {
        out.push('/');
    } else {
        out.push_str(path);
    }
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    out
}

/// Identical scheme + host + effective port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str().map(str::to_lowercase) == b.host_str().map(str::to_lowercase)
        && a.port_or_known_default() == b.port_or_known_default()
}

/// Whether `url`'s host is one of the explicitly allowlisted external
/// domains (exact match or subdomain).
#[must_use]
pub fn in_allowlist(url: &Url, allowed: &[String]) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    allowed.iter().any(|allowed| {
        let allowed = allowed.to_lowercase();
        host == allowed || host.ends_with(&format!(".{allowed}"))
    })
}

/// Hosts whose responses are analytics noise, never page content.
const KNOWN_TRACKERS: &[&str] = &[
    "google-analytics.com",
    "googletagmanager.com",
    "doubleclick.net",
    "connect.facebook.net",
    "hotjar.com",
    "segment.io",
    "clarity.ms",
    "matomo.cloud",
];

#[must_use]
pub fn is_known_tracker(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.to_lowercase();
    KNOWN_TRACKERS
        .iter()
        .any(|tracker| host == *tracker || host.ends_with(&format!(".{tracker}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://example.com/shop/").unwrap()
    }

    #[test]
    fn resolves_relative_links_and_drops_fragments() {
        let url = resolve_link(&base(), "item?id=2#reviews").unwrap();
        assert_eq!(url.as_str(), "https://example.com/shop/item?id=2");
    }

    #[test]
    fn rejects_script_and_mail_schemes() {
        assert!(resolve_link(&base(), "javascript:void(0)").is_none());
        assert!(resolve_link(&base(), "mailto:x@example.com").is_none());
        assert!(resolve_link(&base(), "tel:+15550100").is_none());
        assert!(resolve_link(&base(), "ftp://example.com/file").is_none());
    }

    #[test]
    fn normalization_strips_default_port_and_trailing_slash() {
        let a = Url::parse("https://Example.com:443/Path/").unwrap();
        assert_eq!(normalized(&a), "https://example.com/Path");

        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(normalized(&root), "https://example.com/");

        let custom = Url::parse("http://example.com:8080/x").unwrap();
        assert_eq!(normalized(&custom), "http://example.com:8080/x");
    }

    #[test]
    fn same_origin_requires_scheme_host_and_port() {
        let a = Url::parse("https://example.com/a").unwrap();
        assert!(same_origin(&a, &Url::parse("https://example.com:443/b").unwrap()));
        assert!(!same_origin(&a, &Url::parse("http://example.com/a").unwrap()));
        assert!(!same_origin(&a, &Url::parse("https://www.example.com/a").unwrap()));
        assert!(!same_origin(&a, &Url::parse("https://example.com:8443/a").unwrap()));
    }

    #[test]
    fn allowlist_matches_exact_and_subdomains() {
        let allowed = vec!["cdn.example.net".to_string()];
        assert!(in_allowlist(
            &Url::parse("https://cdn.example.net/img.png").unwrap(),
            &allowed
        ));
        assert!(in_allowlist(
            &Url::parse("https://eu.cdn.example.net/img.png").unwrap(),
            &allowed
        ));
        assert!(!in_allowlist(
            &Url::parse("https://example.net/img.png").unwrap(),
            &allowed
        ));
    }

    #[test]
    fn tracker_hosts_are_recognized() {
        assert!(is_known_tracker(
            &Url::parse("https://www.google-analytics.com/collect").unwrap()
        ));
        assert!(!is_known_tracker(&Url::parse("https://example.com/").unwrap()));
    }
}
