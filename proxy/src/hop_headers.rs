//! Hop-by-hop header stripping
//!
//! Shared by the Origin Client and the Response Pipeline, both of which must drop the same
//! connection-scoped headers before a message crosses a hop.

use hyper::header::HeaderName;
use hyper::HeaderMap;

/// Header names that never survive a hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Whether `name` is a hop-by-hop header (including the `proxy-*` family), which must never
/// appear in a response delivered to the client or a request forwarded to the origin.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    let lower = name.as_str();
    HOP_BY_HOP.contains(&lower) || lower.starts_with("proxy-")
}

/// Remove every hop-by-hop header from `headers` in place.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let to_remove: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_by_hop(name))
        .cloned()
        .collect();
    for name in to_remove {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn strips_every_known_hop_by_hop_header() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("trailer", HeaderValue::from_static("x-checksum"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        headers.insert("content-type", HeaderValue::from_static("text/html"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("te").is_none());
        assert!(headers.get("trailer").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("upgrade").is_none());
        assert!(headers.get("proxy-authenticate").is_none());
        assert!(headers.get("content-type").is_some());
    }
}
