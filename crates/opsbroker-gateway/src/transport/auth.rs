// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Bearer token extraction for WebSocket upgrades (spec §4.3/§4.6).
//!
//! Unlike an HTTP middleware gate, token validation here is only the
//! first half of authentication: a valid bearer token gets the socket
//! upgraded, but the session stays `UNAUTH` until the application-level
//! `AGENT_CONNECT`/`DASHBOARD_INIT` handshake completes.

use axum::http::HeaderMap;

/// Constant-time comparison, used where we compare attacker-supplied
/// material against a secret (kept even though `TokenValidator::validate`
/// does the real check, for any raw-token pre-checks callers add here).
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_from_header(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    header.strip_prefix("Bearer ").map(str::to_owned)
}

/// Extract a `?token=` query parameter, for clients that can't set headers
/// on a WebSocket upgrade request.
pub fn token_from_query(query: &str) -> Option<String> {
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            return Some(value.to_owned());
        }
    }
    None
}

/// Prefer the header; fall back to the query string.
pub fn extract_token(headers: &HeaderMap, query: &str) -> Option<String> {
    bearer_from_header(headers).or_else(|| token_from_query(query))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_takes_precedence_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer from-header".parse().unwrap());
        assert_eq!(extract_token(&headers, "token=from-query").as_deref(), Some("from-header"));
    }

    #[test]
    fn falls_back_to_query_when_no_header() {
        let headers = HeaderMap::new();
        assert_eq!(extract_token(&headers, "token=from-query").as_deref(), Some("from-query"));
    }

    #[test]
    fn constant_time_eq_rejects_mismatched_length() {
        assert!(!constant_time_eq("abc", "abcd"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_strings() {
        assert!(constant_time_eq("same-token", "same-token"));
    }
}
