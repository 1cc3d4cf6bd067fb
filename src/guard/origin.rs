//! Origin allow-listing.
//!
//! With an allowed origin configured, the request's `Origin` header (or the
//! origin of its `Referer` when `Origin` is absent) must match it exactly.
//! Without one the service is in development mode: requests carrying an
//! origin must come from a loopback host, and requests without any origin
//! (curl, server-to-server) pass.

use reqwest::Url;
use std::net::IpAddr;

/// Origin of the request: `Origin` when present, else derived from `Referer`.
pub fn request_origin(origin: Option<&str>, referer: Option<&str>) -> Option<String> {
    if let Some(o) = origin.map(str::trim).filter(|o| !o.is_empty()) {
        return Some(o.trim_end_matches('/').to_string());
    }
    let url = Url::parse(referer?.trim()).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

/// `true` when `origin` is an http(s) URL on a loopback host.
pub fn is_loopback_origin(origin: &str) -> bool {
    let Ok(url) = Url::parse(origin) else {
        return false;
    };
    if !matches!(url.scheme(), "http" | "https") {
        return false;
    }
    match url.host_str() {
        Some("localhost") => true,
        Some(host) => host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|ip| ip.is_loopback()),
        None => false,
    }
}

/// Decide whether a request may proceed.
pub fn origin_allowed(allowed: Option<&str>, origin: Option<&str>, referer: Option<&str>) -> bool {
    let actual = request_origin(origin, referer);
    match allowed {
        Some(allowed) => actual.as_deref() == Some(allowed.trim_end_matches('/')),
        None => actual.as_deref().map_or(true, is_loopback_origin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROD: Option<&str> = Some("https://plainpaper.example");

    #[test]
    fn exact_match_in_production() {
        assert!(origin_allowed(PROD, Some("https://plainpaper.example"), None));
        assert!(!origin_allowed(PROD, Some("https://plainpaper.example.evil.io"), None));
        assert!(!origin_allowed(PROD, Some("http://plainpaper.example"), None));
        assert!(!origin_allowed(PROD, None, None));
    }

    #[test]
    fn referer_used_when_origin_missing() {
        assert!(origin_allowed(
            PROD,
            None,
            Some("https://plainpaper.example/analyze?x=1")
        ));
        assert!(!origin_allowed(PROD, None, Some("https://other.example/")));
        assert!(!origin_allowed(PROD, None, Some("not a url")));
    }

    #[test]
    fn origin_header_wins_over_referer() {
        assert!(!origin_allowed(
            PROD,
            Some("https://other.example"),
            Some("https://plainpaper.example/")
        ));
    }

    #[test]
    fn development_mode_allows_only_loopback() {
        assert!(origin_allowed(None, Some("http://localhost:3000"), None));
        assert!(origin_allowed(None, Some("http://127.0.0.1:8080"), None));
        assert!(origin_allowed(None, Some("http://[::1]:8080"), None));
        assert!(origin_allowed(None, None, Some("http://localhost:3000/page")));
        assert!(origin_allowed(None, None, None));
        assert!(!origin_allowed(None, Some("https://plainpaper.example"), None));
        assert!(!origin_allowed(None, Some("null"), None));
    }

    #[test]
    fn referer_origin_drops_path_and_keeps_port() {
        assert_eq!(
            request_origin(None, Some("http://localhost:3000/a/b")).as_deref(),
            Some("http://localhost:3000")
        );
    }
}
