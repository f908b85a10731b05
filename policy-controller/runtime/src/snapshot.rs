//! Reads the gateway graph and its policies from a YAML document on disk.

use anyhow::{Context, Result};
use gateway_policy_controller_core::{
    ir::{
        BackendObjectIr, BackendRefIr, GatewayIr, HeaderMatch, HttpRouteIr, HttpRouteMatch,
        ListenerIr, ListenerProtocol, PathMatch, RouteRuleIr,
    },
    raw::{ObjectMeta, RawPolicy},
    ObjectSource, GATEWAY_API_GROUP,
};
use regex::Regex;
use std::{collections::BTreeMap, path::PathBuf, sync::Arc};
use tokio::{sync::watch, time};

/// Everything a translation cycle works from.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub gateways: Vec<Arc<GatewayIr>>,
    pub policies: Vec<RawPolicy>,

    /// No configuration is produced until the source has a complete view.
    pub synced: bool,
}

/// Publishes a snapshot parsed from a file, reloading it periodically.
#[derive(Debug)]
pub struct FileSnapshotSource {
    path: PathBuf,
    interval: time::Duration,
    tx: watch::Sender<Arc<Snapshot>>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Document {
    #[serde(default)]
    gateways: Vec<Gateway>,
    #[serde(default)]
    http_routes: Vec<HttpRoute>,
    #[serde(default)]
    backends: Vec<Backend>,
    #[serde(default)]
    policies: Vec<RawPolicy>,
    #[serde(default = "default_synced")]
    synced: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Gateway {
    metadata: ObjectMeta,
    gateway_class_name: String,
    #[serde(default)]
    listeners: Vec<Listener>,
}

#[derive(Debug, serde::Deserialize)]
struct Listener {
    name: String,
    port: u16,
    protocol: ListenerProtocol,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct HttpRoute {
    metadata: ObjectMeta,
    #[serde(default)]
    parent_refs: Vec<ParentRef>,
    #[serde(default)]
    hostnames: Vec<String>,
    #[serde(default)]
    rules: Vec<Rule>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentRef {
    #[serde(default)]
    group: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    #[serde(default)]
    section_name: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Rule {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    matches: Vec<Match>,
    #[serde(default)]
    filters: Vec<Filter>,
    #[serde(default)]
    backend_refs: Vec<BackendRef>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct Match {
    #[serde(default)]
    path: Option<PathSpec>,
    #[serde(default)]
    headers: Vec<HeaderSpec>,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct PathSpec {
    #[serde(rename = "type", default = "default_path_type")]
    type_: String,
    value: String,
}

#[derive(Debug, serde::Deserialize)]
struct HeaderSpec {
    #[serde(rename = "type", default = "default_header_type")]
    type_: String,
    name: String,
    value: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Filter {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    extension_ref: Option<LocalObjectRef>,
}

#[derive(Debug, serde::Deserialize)]
struct LocalObjectRef {
    #[serde(default)]
    group: String,
    kind: String,
    name: String,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackendRef {
    #[serde(default)]
    group: String,
    #[serde(default = "default_backend_kind")]
    kind: String,
    name: String,
    #[serde(default)]
    namespace: Option<String>,
    port: u16,
    #[serde(default = "default_weight")]
    weight: u32,
    #[serde(default)]
    filters: Vec<Filter>,
}

#[derive(Debug, serde::Deserialize)]
struct Backend {
    #[serde(default)]
    group: String,
    #[serde(default = "default_backend_kind")]
    kind: String,
    metadata: ObjectMeta,
    port: u16,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    authority: Option<String>,
}

fn default_synced() -> bool {
    true
}

fn default_path_type() -> String {
    "PathPrefix".to_string()
}

fn default_header_type() -> String {
    "Exact".to_string()
}

fn default_backend_kind() -> String {
    "Service".to_string()
}

fn default_weight() -> u32 {
    1
}

// === impl Snapshot ===

impl Snapshot {
    /// Parses a snapshot document, linking routes to the gateway listeners
    /// they name and backend references to known backends.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let doc = serde_yaml::from_str::<Document>(contents).context("invalid snapshot document")?;
        doc.into_snapshot()
    }
}

// === impl Document ===

impl Document {
    fn into_snapshot(self) -> Result<Snapshot> {
        let backends = self
            .backends
            .into_iter()
            .map(|b| {
                let backend = b.into_ir();
                ((backend.source.clone(), backend.port), Arc::new(backend))
            })
            .collect::<BTreeMap<_, _>>();

        let routes = self
            .http_routes
            .into_iter()
            .map(|route| {
                let ir = route.to_ir(&backends)?;
                Ok((route.parent_refs, Arc::new(ir)))
            })
            .collect::<Result<Vec<_>>>()?;

        let gateways = self
            .gateways
            .into_iter()
            .map(|gw| Arc::new(gw.into_ir(&routes)))
            .collect();

        Ok(Snapshot {
            gateways,
            policies: self.policies,
            synced: self.synced,
        })
    }
}

// === impl Gateway ===

impl Gateway {
    fn into_ir(self, routes: &[(Vec<ParentRef>, Arc<HttpRouteIr>)]) -> GatewayIr {
        let source = ObjectSource::new(
            GATEWAY_API_GROUP,
            "Gateway",
            &self.metadata.namespace,
            &self.metadata.name,
        );
        let listeners = self
            .listeners
            .into_iter()
            .map(|l| {
                let routes = routes
                    .iter()
                    .filter(|(parents, route)| {
                        parents
                            .iter()
                            .any(|p| p.selects(&route.source.namespace, &source, &l))
                    })
                    .map(|(_, route)| route.clone())
                    .collect();
                ListenerIr {
                    name: l.name,
                    port: l.port,
                    protocol: l.protocol,
                    hostname: l.hostname,
                    routes,
                }
            })
            .collect();

        GatewayIr {
            source,
            class_name: self.gateway_class_name,
            listeners,
        }
    }
}

// === impl ParentRef ===

impl ParentRef {
    fn selects(&self, route_ns: &str, gateway: &ObjectSource, listener: &Listener) -> bool {
        let group = self.group.as_deref().unwrap_or(GATEWAY_API_GROUP);
        let kind = self.kind.as_deref().unwrap_or("Gateway");
        let namespace = self.namespace.as_deref().unwrap_or(route_ns);
        if !gateway.is_kind(group, kind)
            || gateway.namespace != namespace
            || gateway.name != self.name
        {
            return false;
        }
        if let Some(section) = self.section_name.as_deref() {
            if section != listener.name {
                return false;
            }
        }
        self.port.map_or(true, |port| port == listener.port)
    }
}

// === impl HttpRoute ===

impl HttpRoute {
    fn to_ir(
        &self,
        backends: &BTreeMap<(ObjectSource, u16), Arc<BackendObjectIr>>,
    ) -> Result<HttpRouteIr> {
        let ns = &self.metadata.namespace;
        let source = ObjectSource::new(GATEWAY_API_GROUP, "HTTPRoute", ns, &self.metadata.name);
        let rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(idx, rule)| {
                rule.to_ir(ns, backends)
                    .with_context(|| format!("invalid rule {idx} of {}", source.resource_name()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(HttpRouteIr {
            source,
            hostnames: self.hostnames.clone(),
            rules,
            creation_timestamp: self.metadata.creation_timestamp,
        })
    }
}

// === impl Rule ===

impl Rule {
    fn to_ir(
        &self,
        ns: &str,
        backends: &BTreeMap<(ObjectSource, u16), Arc<BackendObjectIr>>,
    ) -> Result<RouteRuleIr> {
        let matches = self
            .matches
            .iter()
            .map(Match::to_ir)
            .collect::<Result<Vec<_>>>()?;
        let backends = self
            .backend_refs
            .iter()
            .map(|b| b.to_ir(ns, backends))
            .collect();
        Ok(RouteRuleIr {
            name: self.name.clone(),
            matches,
            backends,
            extension_refs: extension_refs(ns, &self.filters),
        })
    }
}

fn extension_refs(ns: &str, filters: &[Filter]) -> Vec<ObjectSource> {
    filters
        .iter()
        .filter(|f| f.type_ == "ExtensionRef")
        .filter_map(|f| {
            let ext = f.extension_ref.as_ref()?;
            Some(ObjectSource::new(&ext.group, &ext.kind, ns, &ext.name))
        })
        .collect()
}

// === impl Match ===

impl Match {
    fn to_ir(&self) -> Result<HttpRouteMatch> {
        let path = match &self.path {
            None => None,
            Some(PathSpec { type_, value }) => Some(match type_.as_str() {
                "Exact" => PathMatch::Exact(value.clone()),
                "PathPrefix" => PathMatch::Prefix(value.clone()),
                "RegularExpression" => PathMatch::regex(value)?,
                t => anyhow::bail!("unsupported path match type {t}"),
            }),
        };
        let headers = self
            .headers
            .iter()
            .map(|HeaderSpec { type_, name, value }| match type_.as_str() {
                "Exact" => Ok(HeaderMatch::Exact(name.clone(), value.clone())),
                "RegularExpression" => Ok(HeaderMatch::Regex(name.clone(), Regex::new(value)?)),
                t => anyhow::bail!("unsupported header match type {t}"),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(HttpRouteMatch {
            path,
            headers,
            method: self.method.clone(),
        })
    }
}

// === impl BackendRef ===

impl BackendRef {
    fn to_ir(
        &self,
        route_ns: &str,
        backends: &BTreeMap<(ObjectSource, u16), Arc<BackendObjectIr>>,
    ) -> BackendRefIr {
        let ns = self.namespace.as_deref().unwrap_or(route_ns);
        let backend_ref = ObjectSource::new(&self.group, &self.kind, ns, &self.name);
        let backend = backends.get(&(backend_ref.clone(), self.port)).cloned();
        if backend.is_none() {
            tracing::debug!(backend = %backend_ref, port = self.port, "Backend reference does not resolve");
        }
        BackendRefIr {
            backend_ref,
            backend,
            weight: self.weight,
            extension_refs: extension_refs(route_ns, &self.filters),
        }
    }
}

// === impl Backend ===

impl Backend {
    fn into_ir(self) -> BackendObjectIr {
        let address = self.address.unwrap_or_else(|| {
            format!(
                "{}.{}.svc.cluster.local",
                self.metadata.name, self.metadata.namespace
            )
        });
        BackendObjectIr {
            source: ObjectSource::new(
                self.group,
                self.kind,
                &self.metadata.namespace,
                &self.metadata.name,
            ),
            port: self.port,
            address,
            authority: self.authority,
        }
    }
}

// === impl FileSnapshotSource ===

impl FileSnapshotSource {
    /// Returns the source along with a receiver that starts with an empty,
    /// unsynced snapshot.
    pub fn new(
        path: impl Into<PathBuf>,
        interval: time::Duration,
    ) -> (Self, watch::Receiver<Arc<Snapshot>>) {
        let (tx, rx) = watch::channel(Arc::new(Snapshot::default()));
        let source = Self {
            path: path.into(),
            interval,
            tx,
        };
        (source, rx)
    }

    /// Reloads the file on every tick, publishing only when its contents
    /// change. Read and parse failures keep the last good snapshot.
    pub async fn run(self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let mut last = None::<String>;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.tx.closed() => return,
            }

            let contents = match tokio::fs::read_to_string(&self.path).await {
                Ok(contents) => contents,
                Err(error) => {
                    tracing::warn!(path = %self.path.display(), %error, "Failed to read snapshot");
                    continue;
                }
            };
            if last.as_ref() == Some(&contents) {
                continue;
            }

            match Snapshot::from_yaml(&contents) {
                Ok(snapshot) => {
                    tracing::info!(
                        path = %self.path.display(),
                        gateways = snapshot.gateways.len(),
                        policies = snapshot.policies.len(),
                        synced = snapshot.synced,
                        "Loaded snapshot"
                    );
                    self.tx.send_replace(Arc::new(snapshot));
                    last = Some(contents);
                }
                Err(error) => {
                    tracing::warn!(path = %self.path.display(), error = %format_args!("{error:#}"), "Ignoring invalid snapshot");
                }
            }
        }
    }
}
