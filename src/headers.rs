use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::limiter::RateDecision;

/// Headers copied upstream in preserve mode. This list is load-bearing for
/// analytics match quality on tracking posts; treat any edit as a
/// behavioral change, not a cleanup.
const PRESERVE_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "content-type",
    "cookie",
    "dnt",
    "origin",
    "referer",
    "save-data",
    "sec-ch-ua",
    "sec-ch-ua-mobile",
    "sec-ch-ua-model",
    "sec-ch-ua-platform",
    "sec-ch-ua-platform-version",
    "sec-fetch-dest",
    "sec-fetch-mode",
    "sec-fetch-site",
    "user-agent",
];

/// Headers copied upstream in minimal mode (script fetches).
const MINIMAL_HEADERS: &[&str] = &["user-agent", "accept-encoding"];

/// Upstream header policy. Minimal for cacheable script fetches, Preserve for
/// tracking endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Minimal,
    Preserve,
}

/// CORS origin policy, fed to the router's `AllowOrigin::predicate`.
///
/// With a configured allow-list, the origin must appear in it. With an empty
/// list (auto-detect mode) the origin must point back at the request's own
/// host. The literal string "null" is always allowed (sandboxed pixel
/// iframes report it), and since tower-http mirrors the allowed value
/// verbatim, the wildcard never appears alongside credentials.
pub fn origin_allowed(
    origin: &str,
    request_host: Option<&str>,
    allowed_origins: &[String],
) -> bool {
    if origin == "null" {
        return true;
    }

    if !allowed_origins.is_empty() {
        return allowed_origins.iter().any(|allowed| allowed == origin);
    }

    // Auto-detect: allow the request's own host under either scheme
    let (Some(request_host), Some(origin_host)) = (
        request_host,
        origin
            .strip_prefix("https://")
            .or_else(|| origin.strip_prefix("http://")),
    ) else {
        return false;
    };
    origin_host == request_host
}

/// Apply the proxy's security headers and strip the ones that would break
/// third-party iframes (analytics service workers set their own CSP).
pub fn apply_security(headers: &mut HeaderMap) {
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("interest-cohort=()"),
    );
    headers.insert("x-robots-tag", HeaderValue::from_static("noindex"));
    headers.remove("content-security-policy");
    headers.remove("content-security-policy-report-only");
    headers.remove("x-frame-options");
}

/// Expose the rate-limit window state to the client.
pub fn apply_rate_limit(headers: &mut HeaderMap, decision: &RateDecision) {
    let insert = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(v) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), v);
        }
    };
    insert(headers, "x-ratelimit-limit", decision.limit.to_string());
    insert(headers, "x-ratelimit-remaining", decision.remaining.to_string());
    insert(
        headers,
        "x-ratelimit-reset",
        (decision.reset_at_ms / 1000).to_string(),
    );
}

/// Stamp a fresh request id. Every response carries one.
pub fn apply_request_id(headers: &mut HeaderMap) {
    if let Ok(v) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert("x-request-id", v);
    }
}

/// Build the header set for an upstream request.
///
/// Minimal mode sends only what a cache-friendly script fetch needs.
/// Preserve mode copies the curated tracking set and adds the forwarding
/// identity headers derived from the edge's view of the client IP.
pub fn build_upstream_headers(
    incoming: &HeaderMap,
    mode: UpstreamMode,
    client_ip: Option<&str>,
) -> HeaderMap {
    let names: &[&str] = match mode {
        UpstreamMode::Minimal => MINIMAL_HEADERS,
        UpstreamMode::Preserve => PRESERVE_HEADERS,
    };

    let mut out = HeaderMap::new();
    for name in names {
        if let Some(value) = incoming.get(*name) {
            if let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) {
                out.insert(header_name, value.clone());
            }
        }
    }

    if mode == UpstreamMode::Preserve {
        if let Some(ip) = client_ip {
            if let Ok(v) = HeaderValue::from_str(ip) {
                out.insert("x-forwarded-for", v.clone());
                out.insert("x-real-ip", v);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // origin_allowed
    // -----------------------------------------------------------------------

    #[test]
    fn allow_list_accepts_exact_match_only() {
        let allowed = vec!["https://shop.example.com".to_string()];
        assert!(origin_allowed("https://shop.example.com", None, &allowed));
        assert!(!origin_allowed("https://evil.example.com", None, &allowed));
        // Prefix and suffix lookalikes are not matches
        assert!(!origin_allowed("https://shop.example.com.evil.com", None, &allowed));
    }

    #[test]
    fn null_origin_is_always_allowed() {
        assert!(origin_allowed("null", None, &["https://a.com".to_string()]));
        assert!(origin_allowed("null", None, &[]));
    }

    #[test]
    fn auto_detect_allows_own_host() {
        assert!(origin_allowed(
            "https://shop.example.com",
            Some("shop.example.com"),
            &[]
        ));
        assert!(!origin_allowed(
            "https://other.com",
            Some("shop.example.com"),
            &[]
        ));
        // No request host to compare against
        assert!(!origin_allowed("https://shop.example.com", None, &[]));
    }

    // -----------------------------------------------------------------------
    // apply_* header sets
    // -----------------------------------------------------------------------

    #[test]
    fn security_headers_set_and_frame_breakers_removed() {
        let mut headers = HeaderMap::new();
        headers.insert("content-security-policy", HeaderValue::from_static("default-src 'none'"));
        headers.insert("x-frame-options", HeaderValue::from_static("DENY"));

        apply_security(&mut headers);

        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(
            headers.get("permissions-policy").unwrap(),
            "interest-cohort=()"
        );
        assert_eq!(headers.get("x-robots-tag").unwrap(), "noindex");
        assert!(headers.get("content-security-policy").is_none());
        assert!(headers.get("x-frame-options").is_none());
    }

    #[test]
    fn rate_limit_headers_reflect_decision() {
        let mut headers = HeaderMap::new();
        apply_rate_limit(
            &mut headers,
            &RateDecision {
                allowed: true,
                limit: 100,
                remaining: 42,
                reset_at_ms: 1_700_000_000_000,
            },
        );
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "100");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "42");
        assert_eq!(headers.get("x-ratelimit-reset").unwrap(), "1700000000");
    }

    #[test]
    fn request_ids_are_fresh() {
        let mut a = HeaderMap::new();
        let mut b = HeaderMap::new();
        apply_request_id(&mut a);
        apply_request_id(&mut b);
        assert_ne!(a.get("x-request-id").unwrap(), b.get("x-request-id").unwrap());
    }

    // -----------------------------------------------------------------------
    // build_upstream_headers
    // -----------------------------------------------------------------------

    fn incoming() -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        h.insert("accept-encoding", HeaderValue::from_static("gzip"));
        h.insert("cookie", HeaderValue::from_static("_fbp=fb.1.123"));
        h.insert("referer", HeaderValue::from_static("https://shop.example.com/"));
        h.insert("sec-ch-ua", HeaderValue::from_static("\"Chromium\";v=\"130\""));
        h.insert("x-api-key", HeaderValue::from_static("should-not-forward"));
        h
    }

    #[test]
    fn minimal_mode_sends_only_user_agent_and_encoding() {
        let out = build_upstream_headers(&incoming(), UpstreamMode::Minimal, Some("1.2.3.4"));
        assert_eq!(out.get("user-agent").unwrap(), "Mozilla/5.0");
        assert_eq!(out.get("accept-encoding").unwrap(), "gzip");
        assert!(out.get("cookie").is_none());
        assert!(out.get("x-forwarded-for").is_none());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn preserve_mode_copies_tracking_set_and_client_ip() {
        let out = build_upstream_headers(&incoming(), UpstreamMode::Preserve, Some("1.2.3.4"));
        assert_eq!(out.get("cookie").unwrap(), "_fbp=fb.1.123");
        assert_eq!(out.get("referer").unwrap(), "https://shop.example.com/");
        assert_eq!(out.get("sec-ch-ua").unwrap(), "\"Chromium\";v=\"130\"");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "1.2.3.4");
        assert_eq!(out.get("x-real-ip").unwrap(), "1.2.3.4");
        // Non-curated headers never leak upstream
        assert!(out.get("x-api-key").is_none());
    }
}
