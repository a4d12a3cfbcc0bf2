//! Header hygiene at the proxy boundary
//!
//! Hop-by-hop headers are scoped to a single connection and must not cross
//! the proxy; `authorization` is stripped so client tokens never reach
//! backends; `x-internal-*` is reserved for gateway/backend metadata.

use hyper::header::HeaderMap;

/// Dropped from inbound requests before forwarding
const REQUEST_STRIP: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "authorization",
];

/// Hop-by-hop headers (RFC 7230 §6.1), dropped from backend responses
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const INTERNAL_PREFIX: &str = "x-internal-";

/// Copy of `headers` without the request-side strip set.
///
/// `HeaderName` is always lowercase, so the comparison is inherently
/// case-insensitive; repeated values survive via `append`.
pub fn filter_request(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if REQUEST_STRIP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Copy of `headers` without hop-by-hop headers and `x-internal-*`
pub fn filter_response(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) || name.as_str().starts_with(INTERNAL_PREFIX) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::{HeaderName, HeaderValue};

    fn headers_of(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_request_strip_set() {
        let filtered = filter_request(&headers_of(&[
            ("Host", "gateway.local"),
            ("Connection", "keep-alive"),
            ("Content-Length", "42"),
            ("Transfer-Encoding", "chunked"),
            ("Authorization", "Bearer secret"),
            ("Accept", "application/json"),
            ("x-correlation-id", "abc"),
        ]));

        assert!(filtered.get("host").is_none());
        assert!(filtered.get("connection").is_none());
        assert!(filtered.get("content-length").is_none());
        assert!(filtered.get("transfer-encoding").is_none());
        assert!(filtered.get("authorization").is_none());
        assert_eq!(filtered.get("accept").unwrap(), "application/json");
        assert_eq!(filtered.get("x-correlation-id").unwrap(), "abc");
    }

    #[test]
    fn test_response_hop_by_hop() {
        let filtered = filter_response(&headers_of(&[
            ("Keep-Alive", "timeout=5"),
            ("Connection", "close"),
            ("Proxy-Authenticate", "Basic"),
            ("Proxy-Authorization", "Basic xyz"),
            ("TE", "trailers"),
            ("Trailer", "Expires"),
            ("Transfer-Encoding", "chunked"),
            ("Upgrade", "h2c"),
            ("x-test-key", "1234"),
        ]));

        for name in HOP_BY_HOP {
            assert!(filtered.get(name).is_none(), "{} survived", name);
        }
        assert_eq!(filtered.get("x-test-key").unwrap(), "1234");
    }

    #[test]
    fn test_response_internal_prefix() {
        let filtered = filter_response(&headers_of(&[
            ("X-Internal-Trace", "deadbeef"),
            ("x-internal-shard", "7"),
            ("x-request-id", "r-1"),
        ]));

        assert!(filtered.get("x-internal-trace").is_none());
        assert!(filtered.get("x-internal-shard").is_none());
        assert_eq!(filtered.get("x-request-id").unwrap(), "r-1");
    }

    #[test]
    fn test_repeated_values_survive() {
        let filtered = filter_response(&headers_of(&[
            ("Set-Cookie", "a=1"),
            ("Set-Cookie", "b=2"),
        ]));
        let values: Vec<_> = filtered.get_all("set-cookie").iter().collect();
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_authorization_kept_on_responses() {
        // Only the request side strips authorization; a backend response
        // carrying www-authenticate style data passes through.
        let filtered = filter_response(&headers_of(&[("Authorization", "Bearer t")]));
        assert!(filtered.get("authorization").is_some());
    }
}
