//! Upgrade-time checks: origin allow-list, bearer subprotocol, client address.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use axum::http::{header, HeaderMap, Uri};

const BEARER_PREFIX: &str = "bearer.";

/// Origin allow-list.
///
/// An empty list lets every origin through. `null`, `file://` and missing
/// origins always pass, since a valid token is still required after this.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new(origins: &[String]) -> Self {
        let allowed = origins
            .iter()
            .filter_map(|origin| {
                let normalized = normalize_origin(origin);
                if normalized.is_none() {
                    tracing::warn!(origin = %origin, "Ignoring unparseable allowed origin");
                }
                normalized
            })
            .collect();
        Self { allowed }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.allowed.is_empty()
    }

    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin.map(str::trim) else {
            return true;
        };
        if origin.is_empty() || origin == "null" || origin.starts_with("file://") {
            return true;
        }
        if self.is_unrestricted() {
            return true;
        }
        normalize_origin(origin)
            .map(|normalized| self.allowed.contains(&normalized))
            .unwrap_or(false)
    }

    pub fn check(&self, headers: &HeaderMap) -> bool {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok());
        self.is_allowed(origin)
    }
}

/// Lowercased `scheme://host[:port]`, without path, trailing slash or the
/// scheme's default port
pub fn normalize_origin(origin: &str) -> Option<String> {
    let uri: Uri = origin.trim().trim_end_matches('/').parse().ok()?;
    let scheme = uri.scheme_str()?.to_ascii_lowercase();
    let authority = uri.authority()?;
    let host = authority.host().to_ascii_lowercase();

    let default_port = match scheme.as_str() {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    };
    match authority.port_u16() {
        Some(port) if Some(port) != default_port => Some(format!("{}://{}:{}", scheme, host, port)),
        _ => Some(format!("{}://{}", scheme, host)),
    }
}

/// The `bearer.<token>` entry offered in `Sec-WebSocket-Protocol`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerProtocol {
    /// Full entry, echoed back as the negotiated subprotocol
    pub protocol: String,
    pub token: String,
}

pub fn extract_bearer_protocol(headers: &HeaderMap) -> Option<BearerProtocol> {
    headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .find_map(|entry| {
            let token = entry.strip_prefix(BEARER_PREFIX)?;
            if token.is_empty() {
                return None;
            }
            Some(BearerProtocol {
                protocol: entry.to_string(),
                token: token.to_string(),
            })
        })
}

/// Address the connection-rate limit is keyed by
pub fn client_ip(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|first| first.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }
    peer.ip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn policy() -> OriginPolicy {
        OriginPolicy::new(&[
            "https://App.Example.com/".to_string(),
            "http://localhost:5173".to_string(),
        ])
    }

    #[test]
    fn test_origin_normalization() {
        assert_eq!(
            normalize_origin("HTTPS://App.Example.com/"),
            Some("https://app.example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://localhost:5173"),
            Some("http://localhost:5173".to_string())
        );
        assert_eq!(normalize_origin("not an origin"), None);
    }

    #[test]
    fn test_origin_allow_list() {
        let policy = policy();

        assert!(policy.is_allowed(Some("https://app.example.com")));
        assert!(policy.is_allowed(Some("https://APP.example.com/")));
        assert!(policy.is_allowed(Some("http://localhost:5173")));
        assert!(!policy.is_allowed(Some("https://evil.example.com")));
        assert!(!policy.is_allowed(Some("http://localhost:3000")));
    }

    #[test]
    fn test_default_port_matches_bare_origin() {
        assert_eq!(
            normalize_origin("https://app.example.com:443"),
            Some("https://app.example.com".to_string())
        );
        assert_eq!(
            normalize_origin("http://localhost:80/"),
            Some("http://localhost".to_string())
        );
        assert_eq!(
            normalize_origin("http://app.example.com:443"),
            Some("http://app.example.com:443".to_string())
        );

        let policy = policy();
        assert!(policy.is_allowed(Some("https://app.example.com:443")));
        assert!(!policy.is_allowed(Some("https://app.example.com:8443")));
    }

    #[test]
    fn test_null_file_and_missing_origins_pass() {
        let policy = policy();

        assert!(policy.is_allowed(None));
        assert!(policy.is_allowed(Some("null")));
        assert!(policy.is_allowed(Some("file://")));
        assert!(policy.check(&HeaderMap::new()));
    }

    #[test]
    fn test_empty_allow_list_is_unrestricted() {
        let policy = OriginPolicy::new(&[]);
        assert!(policy.is_unrestricted());
        assert!(policy.is_allowed(Some("https://anything.test")));
    }

    #[test]
    fn test_extract_bearer_protocol() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("json, bearer.abc.def.ghi"),
        );

        let bearer = extract_bearer_protocol(&headers).unwrap();
        assert_eq!(bearer.protocol, "bearer.abc.def.ghi");
        assert_eq!(bearer.token, "abc.def.ghi");
    }

    #[test]
    fn test_missing_or_empty_bearer() {
        assert!(extract_bearer_protocol(&HeaderMap::new()).is_none());

        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static("bearer."),
        );
        assert!(extract_bearer_protocol(&headers).is_none());
    }

    #[test]
    fn test_client_ip_forwarded_for() {
        let peer: SocketAddr = "10.0.0.1:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.2"),
        );

        assert_eq!(
            client_ip(&headers, peer, true),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        assert_eq!(client_ip(&headers, peer, false), peer.ip());
        assert_eq!(client_ip(&HeaderMap::new(), peer, true), peer.ip());
    }
}
