//! Proxy runtime configuration objects.
//!
//! These serialize using the proxy's native JSON field names. Maps are ordered
//! so that rendering the same configuration always produces the same bytes.

use serde::{Serialize, Serializer};
use std::{collections::BTreeMap, time::Duration};

pub const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
pub const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
pub const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// A typed protobuf message in its JSON form.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypedConfig {
    #[serde(rename = "@type")]
    pub type_url: String,
    #[serde(flatten)]
    pub value: serde_json::Map<String, serde_json::Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    pub filter_chains: Vec<FilterChain>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SocketAddress {
    pub address: String,
    pub port_value: u16,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterChain {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_chain_match: Option<FilterChainMatch>,
    pub filters: Vec<NetworkFilter>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterChainMatch {
    pub server_names: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkFilter {
    pub name: String,
    pub typed_config: TypedConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpConnectionManager {
    pub stat_prefix: String,
    pub rds: Rds,
    pub http_filters: Vec<HttpFilter>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub stream_idle_timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_header_transformation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_remote_address: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xff_num_trusted_hops: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Rds {
    pub route_config_name: String,
    pub config_source: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpFilter {
    pub name: String,
    pub typed_config: TypedConfig,

    /// Disabled filters are only active on routes that enable them through
    /// per-filter configuration.
    #[serde(skip_serializing_if = "is_false")]
    pub disabled: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteConfiguration {
    pub name: String,
    pub virtual_hosts: Vec<VirtualHost>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<String, TypedConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<Route>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<String, TypedConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Route {
    pub name: String,
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direct_response: Option<DirectResponseAction>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<String, TypedConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safe_regex: Option<RegexMatcher>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegexMatcher {
    pub regex: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderMatcher {
    pub name: String,
    pub string_match: StringMatcher,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatcher {
    Exact(String),
    SafeRegex(RegexMatcher),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteAction {
    pub weighted_clusters: WeightedClusters,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_opt_duration"
    )]
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WeightedClusters {
    pub clusters: Vec<ClusterWeight>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterWeight {
    pub name: String,
    pub weight: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_rewrite_literal: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<String, TypedConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DirectResponseAction {
    pub status: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<DataSource>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataSource {
    pub inline_string: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HeaderValueOption {
    pub header: HeaderValue,
    pub append_action: HeaderAppendAction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HeaderValue {
    pub key: String,
    pub value: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeaderAppendAction {
    AppendIfExistsOrAdd,
    OverwriteIfExistsOrAdd,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,
    #[serde(rename = "type")]
    pub discovery_type: String,
    #[serde(serialize_with = "serialize_duration")]
    pub connect_timeout: Duration,
    pub load_assignment: ClusterLoadAssignment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterLoadAssignment {
    pub cluster_name: String,
    pub endpoints: Vec<LocalityLbEndpoints>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LocalityLbEndpoints {
    pub lb_endpoints: Vec<LbEndpoint>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LbEndpoint {
    pub endpoint: Endpoint,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Endpoint {
    pub address: Address,
}

// === impl TypedConfig ===

impl TypedConfig {
    /// Builds a typed config from a JSON body. Non-object bodies are wrapped
    /// in a `value` field.
    pub fn new(type_url: impl ToString, value: serde_json::Value) -> Self {
        let value = match value {
            serde_json::Value::Object(map) => map,
            value => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), value);
                map
            }
        };
        Self {
            type_url: type_url.to_string(),
            value,
        }
    }

    pub fn encode<T: Serialize>(type_url: impl ToString, message: &T) -> serde_json::Result<Self> {
        Ok(Self::new(type_url, serde_json::to_value(message)?))
    }
}

// === impl Listener ===

impl Listener {
    pub fn new(name: impl ToString, port: u16) -> Self {
        Self {
            name: name.to_string(),
            address: Address::new("0.0.0.0", port),
            filter_chains: vec![],
            per_connection_buffer_limit_bytes: None,
        }
    }
}

impl Address {
    pub fn new(address: impl ToString, port: u16) -> Self {
        Self {
            socket_address: SocketAddress {
                address: address.to_string(),
                port_value: port,
            },
        }
    }
}

// === impl HttpConnectionManager ===

impl HttpConnectionManager {
    pub fn new(stat_prefix: impl ToString, route_config_name: impl ToString) -> Self {
        Self {
            stat_prefix: stat_prefix.to_string(),
            rds: Rds {
                route_config_name: route_config_name.to_string(),
                config_source: serde_json::json!({ "ads": {} }),
            },
            ..Default::default()
        }
    }
}

// === impl HttpFilter ===

impl HttpFilter {
    pub fn router() -> Self {
        Self {
            name: ROUTER_FILTER_NAME.to_string(),
            typed_config: TypedConfig::new(ROUTER_TYPE_URL, serde_json::json!({})),
            disabled: false,
        }
    }
}

// === impl Route ===

impl Route {
    /// Returns the route's forwarding action, creating it if the route has
    /// none yet.
    pub fn route_action_mut(&mut self) -> &mut RouteAction {
        self.route.get_or_insert_with(RouteAction::default)
    }
}

// === impl HeaderValueOption ===

impl HeaderValueOption {
    pub fn append(key: impl ToString, value: impl ToString) -> Self {
        Self::new(key, value, HeaderAppendAction::AppendIfExistsOrAdd)
    }

    pub fn overwrite(key: impl ToString, value: impl ToString) -> Self {
        Self::new(key, value, HeaderAppendAction::OverwriteIfExistsOrAdd)
    }

    fn new(key: impl ToString, value: impl ToString, append_action: HeaderAppendAction) -> Self {
        Self {
            header: HeaderValue {
                key: key.to_string(),
                value: value.to_string(),
            },
            append_action,
        }
    }
}

// === impl Cluster ===

impl Cluster {
    pub fn new(name: impl ToString, address: impl ToString, port: u16) -> Self {
        let name = name.to_string();
        Self {
            discovery_type: "STRICT_DNS".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            load_assignment: ClusterLoadAssignment {
                cluster_name: name.clone(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: vec![LbEndpoint {
                        endpoint: Endpoint {
                            address: Address::new(address, port),
                        },
                    }],
                }],
            },
            per_connection_buffer_limit_bytes: None,
            name,
        }
    }
}

/// Formats a duration as a protobuf JSON duration, e.g. `1.5s`.
pub fn format_duration(d: Duration) -> String {
    let nanos = d.subsec_nanos();
    if nanos == 0 {
        return format!("{}s", d.as_secs());
    }
    let frac = format!("{nanos:09}");
    format!("{}.{}s", d.as_secs(), frac.trim_end_matches('0'))
}

fn serialize_duration<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_duration(*d))
}

fn serialize_opt_duration<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serialize_duration(d, s),
        None => s.serialize_none(),
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}
