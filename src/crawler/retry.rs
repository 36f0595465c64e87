//! Per-page retry classification and backoff.
//!
//! Transient failures (network errors, timeouts, 5xx, 429) are retried with
//! exponential backoff up to the configured attempt budget. Everything else
//! — other 4xx, authentication walls — skips the page immediately.

use std::time::Duration;

use rand::Rng;

use super::types::CrawlError;

/// Whether a navigation error is worth retrying.
#[must_use]
pub fn is_transient(error: &CrawlError) -> bool {
    match error {
        CrawlError::NavigationTimeout | CrawlError::NavigationError(_) => true,
        CrawlError::HttpStatus(status) => status_is_transient(*status),
        _ => false,
    }
}

/// Whether an HTTP status earns a retry.
#[must_use]
pub fn status_is_transient(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

/// Whether an HTTP status marks an authentication page.
#[must_use]
pub fn status_is_auth(status: u16) -> bool {
    status == 401 || status == 403
}

/// Backoff before retry `attempt` (1-based): base doubled per attempt with
/// up to 20% jitter.
#[must_use]
pub fn backoff_for_attempt(base: Duration, attempt: u32) -> Duration {
    let scaled = base.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    let jitter_cap = (scaled.as_millis() as u64 / 5).max(1);
    let jitter = rand::rng().random_range(0..jitter_cap);
    scaled + Duration::from_millis(jitter)
}

/// Client-side redirect targets that identify login walls.
const LOGIN_PATH_MARKERS: &[&str] = &[
    "/login",
    "/signin",
    "/sign-in",
    "/sign_in",
    "/auth/",
    "/account/login",
    "/wp-login",
    "/sso/",
];

/// Whether the post-navigation URL landed on a recognizable login page.
#[must_use]
pub fn is_login_redirect(final_url: &str) -> bool {
    let lowered = final_url.to_lowercase();
    let path = match url::Url::parse(&lowered) {
        Ok(url) => url.path().to_string(),
        Err(_) => lowered,
    };
    LOGIN_PATH_MARKERS.iter().any(|marker| path.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        assert!(is_transient(&CrawlError::NavigationTimeout));
        assert!(is_transient(&CrawlError::NavigationError("reset".into())));
        assert!(is_transient(&CrawlError::HttpStatus(503)));
        assert!(is_transient(&CrawlError::HttpStatus(429)));
        assert!(!is_transient(&CrawlError::HttpStatus(404)));
        assert!(!is_transient(&CrawlError::AuthRequired));
        assert!(!is_transient(&CrawlError::BlockedHost));
    }

    #[test]
    fn status_classes() {
        assert!(status_is_transient(429));
        assert!(status_is_transient(500));
        assert!(status_is_transient(503));
        assert!(!status_is_transient(404));
        assert!(!status_is_transient(200));

        assert!(status_is_auth(401));
        assert!(status_is_auth(403));
        assert!(!status_is_auth(429));
    }

    #[test]
    fn backoff_grows_exponentially() {
        let base = Duration::from_millis(500);
        let first = backoff_for_attempt(base, 1);
        let third = backoff_for_attempt(base, 3);
        assert!(first >= base);
        assert!(third >= Duration::from_millis(2000));
        // Jitter stays under 20%.
        assert!(first < Duration::from_millis(601));
        assert!(third < Duration::from_millis(2401));
    }

    #[test]
    fn login_paths_are_detected() {
        assert!(is_login_redirect("https://e.com/login?next=/"));
        assert!(is_login_redirect("https://e.com/account/Login"));
        assert!(is_login_redirect("https://e.com/wp-login.php"));
        assert!(!is_login_redirect("https://e.com/blog/logging-in-rust"));
        assert!(!is_login_redirect("https://e.com/products"));
    }
}
