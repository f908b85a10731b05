use gateway_policy_controller_core::{
    proxy::{Cluster, Listener, RouteConfiguration},
    ObjectSource,
};
use serde_json::{json, Value};
use std::{collections::BTreeMap, fmt};

/// The proxy configuration produced for one gateway.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxySnapshot {
    pub gateway: ObjectSource,
    pub listeners: Vec<Listener>,
    pub route_configs: BTreeMap<String, RouteConfiguration>,
    pub clusters: BTreeMap<String, Cluster>,

    /// Problems that caused part of the gateway's configuration to be
    /// dropped. The rest of the snapshot is still usable.
    pub diagnostics: Vec<Diagnostic>,
}

/// Describes a route rule, backend, or plugin contribution that was dropped
/// from a snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Diagnostic {
    pub resource: ObjectSource,
    pub rule: Option<usize>,
    pub backend: Option<ObjectSource>,
    pub message: String,
}

// === impl ProxySnapshot ===

impl ProxySnapshot {
    pub fn new(gateway: ObjectSource) -> Self {
        Self {
            gateway,
            ..Default::default()
        }
    }

    /// Renders the snapshot as a static bootstrap document, with each
    /// listener's route configuration inlined in place of its discovery
    /// reference.
    pub fn to_bootstrap(&self) -> serde_json::Result<Value> {
        let listeners = self
            .listeners
            .iter()
            .map(|listener| {
                let mut listener = serde_json::to_value(listener)?;
                inline_route_configs(&mut listener, &self.route_configs)?;
                Ok(listener)
            })
            .collect::<serde_json::Result<Vec<_>>>()?;

        Ok(json!({
            "node": {
                "id": self.gateway.resource_name(),
                "cluster": format!("{}.{}", self.gateway.name, self.gateway.namespace),
            },
            "static_resources": {
                "listeners": listeners,
                "clusters": self.clusters.values().collect::<Vec<_>>(),
            },
        }))
    }
}

fn inline_route_configs(
    listener: &mut Value,
    route_configs: &BTreeMap<String, RouteConfiguration>,
) -> serde_json::Result<()> {
    let chains = listener
        .get_mut("filter_chains")
        .and_then(Value::as_array_mut);
    for chain in chains.into_iter().flatten() {
        let filters = chain.get_mut("filters").and_then(Value::as_array_mut);
        for filter in filters.into_iter().flatten() {
            let Some(config) = filter
                .get_mut("typed_config")
                .and_then(Value::as_object_mut)
            else {
                continue;
            };
            let Some(rds) = config.remove("rds") else {
                continue;
            };
            let name = rds
                .get("route_config_name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match route_configs.get(name) {
                Some(rc) => {
                    config.insert("route_config".to_string(), serde_json::to_value(rc)?);
                }
                None => {
                    config.insert("rds".to_string(), rds);
                }
            }
        }
    }
    Ok(())
}

// === impl Diagnostic ===

impl Diagnostic {
    pub fn new(resource: ObjectSource, message: impl ToString) -> Self {
        Self {
            resource,
            rule: None,
            backend: None,
            message: message.to_string(),
        }
    }

    pub fn with_rule(mut self, rule: usize) -> Self {
        self.rule = Some(rule);
        self
    }

    pub fn with_backend(mut self, backend: ObjectSource) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.resource)?;
        if let Some(rule) = self.rule {
            write!(f, " rule {rule}")?;
        }
        if let Some(backend) = &self.backend {
            write!(f, " backend {backend}")?;
        }
        write!(f, ": {}", self.message)
    }
}
