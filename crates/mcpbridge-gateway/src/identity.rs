//! Identity extraction from gateway-injected headers.
//!
//! The upstream reverse proxy validates bearer tokens and injects
//! `X-User-Id`, `X-User-Username`, and `X-User-Role`. Presence of a
//! well-formed `X-User-Id` is the proof of authentication here.

use axum::http::HeaderMap;
use mcpbridge_engine::Identity;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USERNAME: &str = "x-user-username";
pub const HEADER_ROLE: &str = "x-user-role";

/// Roles allowed onto the admin surfaces.
pub const ADMIN_ROLES: &[&str] = &["admin", "super_admin"];

/// Parse the identity headers. `None` when absent or malformed — the
/// pipeline turns that into `AuthMissing`.
pub fn from_headers(headers: &HeaderMap) -> Option<Identity> {
    let user_id: i64 = headers
        .get(HEADER_USER_ID)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()?;
    let username = headers
        .get(HEADER_USERNAME)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let role = headers
        .get(HEADER_ROLE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    Some(Identity {
        user_id,
        username,
        role,
    })
}

pub fn is_admin(identity: &Identity) -> bool {
    ADMIN_ROLES.iter().any(|r| *r == identity.role)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(id: &str, name: &str, role: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(HEADER_USER_ID, HeaderValue::from_str(id).unwrap());
        h.insert(HEADER_USERNAME, HeaderValue::from_str(name).unwrap());
        h.insert(HEADER_ROLE, HeaderValue::from_str(role).unwrap());
        h
    }

    #[test]
    fn well_formed_headers_parse() {
        let identity = from_headers(&headers("42", "alice", "admin")).unwrap();
        assert_eq!(identity.user_id, 42);
        assert_eq!(identity.username, "alice");
        assert!(is_admin(&identity));
    }

    #[test]
    fn missing_or_malformed_id_yields_none() {
        assert!(from_headers(&HeaderMap::new()).is_none());
        assert!(from_headers(&headers("not-a-number", "x", "y")).is_none());
    }

    #[test]
    fn id_alone_suffices() {
        let mut h = HeaderMap::new();
        h.insert(HEADER_USER_ID, HeaderValue::from_static("7"));
        let identity = from_headers(&h).unwrap();
        assert_eq!(identity.user_id, 7);
        assert!(identity.username.is_empty());
        assert!(!is_admin(&identity));
    }
}
