use crate::ObjectSource;
use anyhow::Result;
use chrono::{offset::Utc, DateTime};
use regex::Regex;
use std::sync::Arc;

/// A gateway and every route attached to its listeners, as produced by the
/// collection layer.
#[derive(Clone, Debug, PartialEq)]
pub struct GatewayIr {
    pub source: ObjectSource,
    pub class_name: String,
    pub listeners: Vec<ListenerIr>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListenerIr {
    pub name: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub hostname: Option<String>,
    pub routes: Vec<Arc<HttpRouteIr>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Deserialize)]
pub enum ListenerProtocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "HTTPS")]
    Https,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HttpRouteIr {
    pub source: ObjectSource,
    pub hostnames: Vec<String>,
    pub rules: Vec<RouteRuleIr>,

    /// This is required for ordering routes by their creation timestamp.
    pub creation_timestamp: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RouteRuleIr {
    pub name: Option<String>,
    pub matches: Vec<HttpRouteMatch>,
    pub backends: Vec<BackendRefIr>,

    /// Policies referenced by `ExtensionRef` filters on the rule.
    pub extension_refs: Vec<ObjectSource>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BackendRefIr {
    /// The object named by the reference, whether or not it exists.
    pub backend_ref: ObjectSource,

    /// The resolved backend; `None` when the reference does not resolve.
    pub backend: Option<Arc<BackendObjectIr>>,
    pub weight: u32,

    /// Policies referenced by `ExtensionRef` filters on the backend reference.
    pub extension_refs: Vec<ObjectSource>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackendObjectIr {
    pub source: ObjectSource,
    pub port: u16,
    pub address: String,

    /// When set, requests to this backend are sent with this authority.
    pub authority: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpRouteMatch {
    pub path: Option<PathMatch>,
    pub headers: Vec<HeaderMatch>,
    pub method: Option<String>,
}

#[derive(Clone, Debug)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

#[derive(Clone, Debug)]
pub enum HeaderMatch {
    Exact(String, String),
    Regex(String, Regex),
}

// === impl ListenerIr ===

impl ListenerIr {
    /// Determines the virtual host domains a route is served under on this
    /// listener. Each route hostname is narrowed to its intersection with the
    /// listener's hostname, and hostnames that cannot match it are dropped.
    pub fn route_domains(&self, route: &HttpRouteIr) -> Vec<String> {
        if route.hostnames.is_empty() {
            return vec![self.hostname.clone().unwrap_or_else(|| "*".to_string())];
        }

        let Some(listener) = self.hostname.as_deref() else {
            return route.hostnames.clone();
        };
        let mut domains = Vec::with_capacity(route.hostnames.len());
        for host in &route.hostnames {
            if let Some(domain) = hostname_intersection(listener, host) {
                if !domains.iter().any(|d| d == domain) {
                    domains.push(domain.to_string());
                }
            }
        }
        domains
    }
}

/// Returns the more specific of two hostnames when one matches the other.
fn hostname_intersection<'h>(a: &'h str, b: &'h str) -> Option<&'h str> {
    fn covers(wildcard: &str, host: &str) -> bool {
        match wildcard.strip_prefix('*') {
            Some(suffix) => host.ends_with(suffix) && host.len() > suffix.len(),
            None => false,
        }
    }
    if a == b || covers(b, a) {
        Some(a)
    } else if covers(a, b) {
        Some(b)
    } else {
        None
    }
}

// === impl BackendObjectIr ===

impl BackendObjectIr {
    /// The name of the proxy cluster that serves this backend.
    pub fn cluster_name(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.source.kind.to_ascii_lowercase(),
            self.source.namespace,
            self.source.name,
            self.port
        )
    }
}

// === impl HttpRouteMatch ===

impl HttpRouteMatch {
    pub fn prefix(prefix: impl ToString) -> Self {
        Self {
            path: Some(PathMatch::Prefix(prefix.to_string())),
            ..Default::default()
        }
    }
}

// === impl PathMatch ===

impl PartialEq for PathMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(l0), Self::Exact(r0)) => l0 == r0,
            (Self::Prefix(l0), Self::Prefix(r0)) => l0 == r0,
            (Self::Regex(l0), Self::Regex(r0)) => l0.as_str() == r0.as_str(),
            _ => false,
        }
    }
}

impl Eq for PathMatch {}

impl PathMatch {
    pub fn regex(s: &str) -> Result<Self> {
        Ok(Self::Regex(Regex::new(s)?))
    }
}

// === impl HeaderMatch ===

impl PartialEq for HeaderMatch {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Exact(n0, v0), Self::Exact(n1, v1)) => n0 == n1 && v0 == v1,
            (Self::Regex(n0, r0), Self::Regex(n1, r1)) => n0 == n1 && r0.as_str() == r1.as_str(),
            _ => false,
        }
    }
}

impl Eq for HeaderMatch {}

impl HeaderMatch {
    pub fn name(&self) -> &str {
        match self {
            Self::Exact(name, _) | Self::Regex(name, _) => name,
        }
    }
}
