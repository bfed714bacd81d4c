//! Upstream route resolution from `targetHost` / `path` query parameters.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::config::RoutePolicy;
use crate::error::{GatewayError, Result};

/// Query string accepted on the proxy endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteQuery {
    #[serde(rename = "targetHost", alias = "target_host")]
    pub target_host: Option<String>,
    pub path: Option<String>,
}

impl RouteQuery {
    pub fn new(target_host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            target_host: Some(target_host.into()),
            path: Some(path.into()),
        }
    }
}

/// A resolved upstream target. `url` is always absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteParameters {
    pub target_host: String,
    pub path: String,
    pub url: Url,
}

static HOST_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct RouteResolver {
    policy: RoutePolicy,
}

impl RouteResolver {
    pub fn new(policy: RoutePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RoutePolicy {
        &self.policy
    }

    pub fn resolve(&self, query: &RouteQuery) -> Result<RouteParameters> {
        let host = non_blank(query.target_host.as_deref());
        let path = non_blank(query.path.as_deref());

        let host = match (host, path) {
            (None, None) if self.policy.path_required => {
                return Err(GatewayError::Routing(
                    "missing required query parameters: targetHost and path".into(),
                ))
            }
            (None, _) => {
                return Err(GatewayError::Routing(
                    "missing required query parameter: targetHost".into(),
                ))
            }
            (Some(h), _) => h,
        };
        self.resolve_parts(host, path)
    }

    /// Resolve a host plus optional path, applying the path policy.
    pub fn resolve_parts(&self, host: &str, path: Option<&str>) -> Result<RouteParameters> {
        let host = host.trim();
        validate_host(host)?;
        if !self.host_allowed(host) {
            return Err(GatewayError::Routing(format!(
                "targetHost '{host}' is not an allowed upstream"
            )));
        }

        let path = match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => normalize_path(p)?,
            None if self.policy.path_required => {
                return Err(GatewayError::Routing(
                    "missing required query parameter: path".into(),
                ))
            }
            None => normalize_path(&self.policy.default_path)?,
        };

        let raw = format!("{}://{}{}", self.policy.upstream_scheme, host, path);
        let url = Url::parse(&raw)
            .map_err(|e| GatewayError::Routing(format!("invalid upstream URL '{raw}': {e}")))?;
        if url.host_str().is_none() {
            return Err(GatewayError::Routing(format!(
                "invalid upstream URL '{raw}': missing host"
            )));
        }

        Ok(RouteParameters {
            target_host: host.to_string(),
            path,
            url,
        })
    }

    fn host_allowed(&self, host: &str) -> bool {
        if self.policy.allowed_hosts.is_empty() {
            return true;
        }
        let bare = split_port(host).0;
        self.policy
            .allowed_hosts
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(host) || allowed.eq_ignore_ascii_case(bare))
    }
}

fn non_blank(v: Option<&str>) -> Option<&str> {
    v.filter(|s| !s.trim().is_empty())
}

fn split_port(host: &str) -> (&str, Option<&str>) {
    if host.starts_with('[') {
        // [v6]:port
        return match host.find(']') {
            Some(end) => {
                let rest = &host[end + 1..];
                (&host[..=end], rest.strip_prefix(':'))
            }
            None => (host, None),
        };
    }
    match host.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (host, None),
    }
}

fn validate_host(host: &str) -> Result<()> {
    let bad = |why: &str| Err(GatewayError::Routing(format!("invalid targetHost '{host}': {why}")));

    if host.is_empty() {
        return bad("empty host");
    }
    let (name, port) = split_port(host);

    if let Some(port) = port {
        match port.parse::<u16>() {
            Ok(p) if p > 0 => {}
            _ => return bad("invalid port"),
        }
    }

    if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        return match inner.parse::<std::net::Ipv6Addr>() {
            Ok(_) => Ok(()),
            Err(_) => bad("invalid IPv6 literal"),
        };
    }

    if name.len() > 253 {
        return bad("host name too long");
    }
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || !name.split('.').all(|label| HOST_LABEL.is_match(label)) {
        return bad("contains characters not allowed in a host name");
    }
    Ok(())
}

fn normalize_path(path: &str) -> Result<String> {
    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GatewayError::Routing(format!(
            "invalid path '{path}': contains whitespace"
        )));
    }
    if path.contains('#') || path.contains("://") {
        return Err(GatewayError::Routing(format!("invalid path '{path}'")));
    }
    let normalized = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let segments = normalized.split('?').next().unwrap_or("");
    // URL parsing treats `\` as `/` and `%2e` as `.`, so both count here
    if segments.split(['/', '\\']).any(is_parent_segment) {
        return Err(GatewayError::Routing(format!(
            "invalid path '{path}': parent segments are not allowed"
        )));
    }
    Ok(normalized)
}

fn is_parent_segment(seg: &str) -> bool {
    seg.to_ascii_lowercase().replace("%2e", ".") == ".."
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> RouteResolver {
        RouteResolver::default()
    }

    fn routing_message(err: GatewayError) -> String {
        match err {
            GatewayError::Routing(m) => m,
            other => panic!("expected routing error, got {other:?}"),
        }
    }

    #[test]
    fn resolves_https_url() {
        let route = resolver()
            .resolve(&RouteQuery::new("api.openai.com", "/v1/chat/completions"))
            .unwrap();
        assert_eq!(
            route.url.as_str(),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(route.target_host, "api.openai.com");
    }

    #[test]
    fn missing_both_parameters_is_rejected() {
        let err = resolver().resolve(&RouteQuery::default()).unwrap_err();
        assert_eq!(
            routing_message(err),
            "missing required query parameters: targetHost and path"
        );
    }

    #[test]
    fn missing_path_depends_on_policy() {
        let query = RouteQuery {
            target_host: Some("api.openai.com".into()),
            path: None,
        };
        assert!(resolver().resolve(&query).is_err());

        let lenient = RouteResolver::new(RoutePolicy {
            path_required: false,
            ..RoutePolicy::default()
        });
        let route = lenient.resolve(&query).unwrap();
        assert_eq!(route.path, "/v1/chat/completions");

        let err = lenient.resolve(&RouteQuery::default()).unwrap_err();
        assert_eq!(
            routing_message(err),
            "missing required query parameter: targetHost"
        );
    }

    #[test]
    fn rejects_malformed_hosts() {
        for host in [
            "api openai.com",
            "user@api.openai.com",
            "api.openai.com/evil",
            "-bad.example.com",
            "a..b",
            "host:0",
            "host:99999",
            "[not-v6]",
        ] {
            let res = resolver().resolve(&RouteQuery::new(host, "/v1/chat/completions"));
            assert!(res.is_err(), "host {host:?} should be rejected");
        }
    }

    #[test]
    fn accepts_ports_and_ipv6() {
        let http = RouteResolver::new(RoutePolicy {
            upstream_scheme: "http".into(),
            ..RoutePolicy::default()
        });
        let route = http
            .resolve(&RouteQuery::new("127.0.0.1:8080", "v1/chat/completions"))
            .unwrap();
        assert_eq!(
            route.url.as_str(),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
        assert!(http
            .resolve(&RouteQuery::new("[::1]:9000", "/v1/chat/completions"))
            .is_ok());
    }

    #[test]
    fn rejects_suspicious_paths() {
        for path in [
            "/v1/../admin",
            "/v1/%2e%2e/admin",
            "/v1/%2E./admin",
            "/v1/.%2e",
            "/v1\\..\\admin",
            "/a b",
            "/x#frag",
            "http://other/",
        ] {
            assert!(
                resolver()
                    .resolve(&RouteQuery::new("api.openai.com", path))
                    .is_err(),
                "path {path:?} should be rejected"
            );
        }
    }

    #[test]
    fn encoded_dots_inside_segments_are_kept() {
        let route = resolver()
            .resolve(&RouteQuery::new("api.openai.com", "/v1/models/gpt-4o%2e1"))
            .unwrap();
        assert_eq!(route.url.path(), "/v1/models/gpt-4o%2e1");
    }

    #[test]
    fn allow_list_is_enforced() {
        let strict = RouteResolver::new(RoutePolicy {
            allowed_hosts: vec!["api.openai.com".into()],
            ..RoutePolicy::default()
        });
        assert!(strict
            .resolve(&RouteQuery::new("API.OpenAI.com", "/v1/chat/completions"))
            .is_ok());
        let err = strict
            .resolve(&RouteQuery::new("evil.example.com", "/v1/chat/completions"))
            .unwrap_err();
        assert!(routing_message(err).contains("not an allowed upstream"));
    }

    #[test]
    fn query_accepts_camel_and_snake_case() {
        let q: RouteQuery =
            serde_json::from_value(serde_json::json!({"targetHost": "a.com", "path": "/p"})).unwrap();
        assert_eq!(q.target_host.as_deref(), Some("a.com"));
        let q: RouteQuery =
            serde_json::from_value(serde_json::json!({"target_host": "b.com"})).unwrap();
        assert_eq!(q.target_host.as_deref(), Some("b.com"));
    }
}
