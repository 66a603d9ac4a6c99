//! Header forwarding between the caller and the upstream LLM.

use axum::http::HeaderMap;

/// Headers that stay behind when forwarding: hop-by-hop headers, headers
/// reqwest computes for the rebuilt request body, and the content
/// negotiation the gateway sets itself. Everything else, including
/// `Authorization`, goes through verbatim.
const SKIPPED_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "connection",
    "content-length",
    "content-type",
    "host",
    "keep-alive",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn apply_request_headers(
    headers: &HeaderMap,
    mut request_builder: reqwest::RequestBuilder,
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        let skip = SKIPPED_HEADERS
            .iter()
            .any(|skipped| name.as_str().eq_ignore_ascii_case(skipped));
        if !skip {
            request_builder = request_builder.header(name.clone(), value.clone());
        }
    }
    request_builder
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn forwards_authorization_and_drops_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer sk-123"));
        headers.insert("host", HeaderValue::from_static("proxy.local"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("x-request-id", HeaderValue::from_static("req-1"));

        let client = reqwest::Client::new();
        let builder = apply_request_headers(&headers, client.post("http://upstream/v1"));
        let request = builder.build().unwrap();

        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer sk-123"
        );
        assert_eq!(request.headers().get("x-request-id").unwrap(), "req-1");
        assert!(request.headers().get("host").is_none());
        assert!(request.headers().get("connection").is_none());
    }

    #[test]
    fn content_headers_are_left_to_reqwest() {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("text/plain"));
        headers.insert("content-length", HeaderValue::from_static("9999"));

        let client = reqwest::Client::new();
        let builder = apply_request_headers(&headers, client.post("http://upstream/v1"));
        let request = builder.build().unwrap();

        assert!(request.headers().get("content-type").is_none());
        assert!(request.headers().get("content-length").is_none());
    }
}
