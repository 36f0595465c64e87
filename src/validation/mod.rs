//! Admission validation for scan submissions.
//!
//! Two layers share this module: syntactic checks applied once at ingress
//! (`validate_submission`) and the connect-time SSRF defense in [`ssrf`],
//! which the crawler re-runs against fresh DNS answers before every page
//! navigation.

pub mod ssrf;

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

pub use ssrf::{HostCheck, ResolvingHostCheck, is_private_or_reserved, validate_host_for_connect};

const MAX_URL_LEN: usize = 2048;
const MAX_EMAIL_LEN: usize = 254;

/// Standard mailbox form; length is checked separately.
static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$")
        .expect("email pattern compiles")
});

/// Validation failures, each with a stable user-visible code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("url does not parse or exceeds {MAX_URL_LEN} characters")]
    UrlSyntax,
    #[error("url scheme must be http or https")]
    UrlScheme,
    #[error("url host is private, reserved, or otherwise blocked")]
    UrlBlockedHost,
    #[error("email address is not a valid mailbox")]
    EmailSyntax,
    #[error("email address exceeds {MAX_EMAIL_LEN} characters")]
    EmailTooLong,
}

impl ValidationError {
    /// Stable machine-readable code for API payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::UrlSyntax => "UrlSyntax",
            Self::UrlScheme => "UrlScheme",
            Self::UrlBlockedHost => "UrlBlockedHost",
            Self::EmailSyntax => "EmailSyntax",
            Self::EmailTooLong => "EmailTooLong",
        }
    }
}

/// Validate a scan submission.
///
/// All rules are applied and every violated rule is reported, so the caller
/// can surface the full reason list in one response. On success the parsed
/// URL is returned for downstream use.
pub fn validate_submission(
    raw_url: &str,
    email: Option<&str>,
    enforce_https: bool,
) -> Result<Url, Vec<ValidationError>> {
    let mut reasons = Vec::new();

    let parsed = if raw_url.len() > MAX_URL_LEN {
        reasons.push(ValidationError::UrlSyntax);
        None
    } else {
        match Url::parse(raw_url) {
            Ok(url) => Some(url),
            Err(_) => {
                reasons.push(ValidationError::UrlSyntax);
                None
            }
        }
    };

    if let Some(url) = &parsed {
        let scheme_ok = match url.scheme() {
            "https" => true,
            "http" => !enforce_https,
            _ => false,
        };
        if !scheme_ok {
            reasons.push(ValidationError::UrlScheme);
        }

        if host_is_blocked_syntactically(url) {
            reasons.push(ValidationError::UrlBlockedHost);
        }
    }

    if let Some(email) = email {
        if email.len() > MAX_EMAIL_LEN {
            reasons.push(ValidationError::EmailTooLong);
        } else if !EMAIL_RE.is_match(email) {
            reasons.push(ValidationError::EmailSyntax);
        }
    }

    match (parsed, reasons.is_empty()) {
        (Some(url), true) => Ok(url),
        _ => Err(reasons),
    }
}

/// Literal-host checks that need no DNS: `localhost` and IP-literal hosts in
/// private or reserved ranges. Hostnames pass here and are re-judged at
/// connect time against their resolved addresses.
fn host_is_blocked_syntactically(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(ip)) => is_private_or_reserved(ip.into()),
        Some(url::Host::Ipv6(ip)) => is_private_or_reserved(ip.into()),
        None => true,
    }
}
