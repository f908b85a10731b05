use crate::{Diagnostic, ProxySnapshot};
use gateway_policy_controller_core::{
    ir::{
        BackendObjectIr, BackendRefIr, GatewayIr, HeaderMatch, HttpRouteIr, HttpRouteMatch,
        ListenerIr, ListenerProtocol, PathMatch, RouteRuleIr,
    },
    pass::{
        FilterChainCommon, GatewayContext, HcmContext, ListenerContext, PassError,
        ProxyTranslationPass, RouteBackendContext, RouteConfigContext, RouteContext,
        VirtualHostContext,
    },
    proxy::{
        Cluster, ClusterWeight, DirectResponseAction, FilterChain, FilterChainMatch,
        HeaderMatcher, HttpConnectionManager, HttpFilter, Listener, NetworkFilter, RegexMatcher,
        Route, RouteConfiguration, RouteMatch, StringMatcher, TypedConfig, VirtualHost,
        HCM_FILTER_NAME, HCM_TYPE_URL, ROUTER_FILTER_NAME,
    },
    InheritedPolicyPriority, PolicyKind,
};
use gateway_policy_controller_index::{
    GatewayPolicies, PolicyRegistry, RouteBackendId, RuleId,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// Translates a gateway and its resolved policies into proxy configuration.
///
/// Each call creates a fresh translation pass per registered plugin and runs
/// the passes' hooks in pipeline order. A translation is synchronous and
/// touches no shared state, so gateways may be translated in parallel.
#[derive(Clone, Debug)]
pub struct GatewayTranslator {
    registry: Arc<PolicyRegistry>,
    inherited_policy_priority: InheritedPolicyPriority,
}

struct Pass {
    kind: PolicyKind,
    pass: Box<dyn ProxyTranslationPass>,
}

struct Translation<'a> {
    registry: &'a PolicyRegistry,
    inherited_policy_priority: InheritedPolicyPriority,
    gateway: &'a GatewayIr,
    ctx: GatewayContext,
    policies: &'a GatewayPolicies,
    passes: Vec<Pass>,
    backends: BTreeMap<String, Arc<BackendObjectIr>>,
    out: ProxySnapshot,
}

const DIRECT_RESPONSE_STATUS: u32 = 500;

// === impl GatewayTranslator ===

impl GatewayTranslator {
    pub fn new(
        registry: Arc<PolicyRegistry>,
        inherited_policy_priority: InheritedPolicyPriority,
    ) -> Self {
        Self {
            registry,
            inherited_policy_priority,
        }
    }

    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    pub fn inherited_policy_priority(&self) -> InheritedPolicyPriority {
        self.inherited_policy_priority
    }

    pub fn translate(&self, gateway: &GatewayIr, policies: &GatewayPolicies) -> ProxySnapshot {
        let ctx = GatewayContext {
            gateway: gateway.source.clone(),
            class_name: gateway.class_name.clone(),
        };
        let passes = self
            .registry
            .plugins()
            .map(|plugin| Pass {
                kind: plugin.kind_info().kind.clone(),
                pass: plugin.new_translation_pass(&ctx),
            })
            .collect();

        let mut translation = Translation {
            registry: &self.registry,
            inherited_policy_priority: self.inherited_policy_priority,
            gateway,
            ctx,
            policies,
            passes,
            backends: BTreeMap::new(),
            out: ProxySnapshot::new(gateway.source.clone()),
        };
        for listener in &gateway.listeners {
            translation.listener(listener);
        }
        translation.clusters();
        translation.resources();

        let snapshot = translation.out;
        tracing::debug!(
            gateway = %gateway.source,
            listeners = snapshot.listeners.len(),
            clusters = snapshot.clusters.len(),
            diagnostics = snapshot.diagnostics.len(),
            "Translated gateway",
        );
        snapshot
    }
}

// === impl Translation ===

impl Translation<'_> {
    fn listener(&mut self, listener: &ListenerIr) {
        let policies = self.policies;
        let attached = policies.listener(&listener.name);
        let name = format!(
            "{}_{}_{}",
            self.gateway.source.namespace, self.gateway.source.name, listener.name
        );

        let mut out = Listener::new(&name, listener.port);
        for Pass { kind, pass } in &mut self.passes {
            let ctx = ListenerContext {
                policy: attached.get(kind),
                listener,
                gateway: &self.ctx,
            };
            pass.apply_listener_plugin(&ctx, &mut out);
        }

        let mut route_config = RouteConfiguration {
            name: name.clone(),
            ..Default::default()
        };
        let mut ctx = RouteConfigContext {
            filter_chain_name: &listener.name,
            gateway: &self.ctx,
            typed_filter_config: Default::default(),
        };
        for Pass { pass, .. } in &mut self.passes {
            pass.apply_route_config_plugin(&mut ctx, &mut route_config);
        }
        ctx.typed_filter_config
            .flush_into(&mut route_config.typed_per_filter_config);

        let mut vhosts = BTreeMap::<String, Vec<Route>>::new();
        for route in &listener.routes {
            let domains = listener.route_domains(route);
            if domains.is_empty() {
                tracing::debug!(route = %route.source, listener = %listener.name, "Route hostnames do not intersect the listener");
                continue;
            }
            let mut routes = Vec::new();
            for (idx, rule) in route.rules.iter().enumerate() {
                routes.extend(self.rule(listener, route, idx, rule));
            }
            for domain in domains {
                vhosts
                    .entry(domain)
                    .or_default()
                    .extend(routes.iter().cloned());
            }
        }

        for (domain, routes) in vhosts {
            let mut vhost = VirtualHost {
                name: format!("{}~{}", listener.name, domain),
                domains: vec![domain],
                routes,
                ..Default::default()
            };
            let mut ctx = VirtualHostContext {
                policy: None,
                filter_chain_name: &listener.name,
                gateway: &self.ctx,
                typed_filter_config: Default::default(),
            };
            for Pass { kind, pass } in &mut self.passes {
                ctx.policy = attached.get(kind);
                pass.apply_vhost_plugin(&mut ctx, &mut vhost);
            }
            ctx.typed_filter_config
                .flush_into(&mut vhost.typed_per_filter_config);
            route_config.virtual_hosts.push(vhost);
        }

        let filter_chain = FilterChainCommon {
            name: listener.name.clone(),
            listener: listener.name.clone(),
            port: listener.port,
        };
        let mut hcm = HttpConnectionManager::new(&listener.name, &name);
        hcm.http_filters = self.http_filters(&filter_chain);
        let mut filters = self.network_filters();

        let gateway = self.gateway;
        for Pass { kind, pass } in &mut self.passes {
            let ctx = HcmContext {
                policy: attached.get(kind),
                gateway,
                listener,
            };
            let mut next = hcm.clone();
            match pass.apply_hcm(&ctx, &mut next) {
                Ok(()) => hcm = next,
                Err(error) => self
                    .out
                    .diagnostics
                    .push(plugin_diagnostic(gateway, kind, &error)),
            }
        }

        let typed_config = match TypedConfig::encode(HCM_TYPE_URL, &hcm) {
            Ok(config) => config,
            Err(error) => {
                tracing::error!(gateway = %gateway.source, listener = %listener.name, %error, "Failed to encode connection manager");
                self.out.diagnostics.push(Diagnostic::new(
                    gateway.source.clone(),
                    format!("listener {}: failed to encode connection manager", listener.name),
                ));
                return;
            }
        };
        filters.push(NetworkFilter {
            name: HCM_FILTER_NAME.to_string(),
            typed_config,
        });

        let filter_chain_match = match (listener.protocol, &listener.hostname) {
            (ListenerProtocol::Https, Some(hostname)) => Some(FilterChainMatch {
                server_names: vec![hostname.clone()],
            }),
            _ => None,
        };
        out.filter_chains.push(FilterChain {
            name: filter_chain.name,
            filter_chain_match,
            filters,
        });

        self.out.route_configs.insert(name, route_config);
        self.out.listeners.push(out);
    }

    /// Builds the routes for one rule, one per match. Returns nothing if the
    /// rule was dropped.
    fn rule(
        &mut self,
        listener: &ListenerIr,
        route: &HttpRouteIr,
        idx: usize,
        rule: &RouteRuleIr,
    ) -> Vec<Route> {
        let policies = self.policies;
        let id = RuleId {
            listener: listener.name.clone(),
            route: route.source.clone(),
            rule: idx,
        };
        let attached = policies.rule(&id);

        let mut out = Route {
            name: format!("{}/{idx}", route.source.resource_name()),
            ..Default::default()
        };
        let mut ctx = RouteContext {
            policy: None,
            filter_chain_name: &listener.name,
            gateway: &self.ctx,
            listener,
            route,
            rule,
            inherited_policy_priority: self.inherited_policy_priority,
            typed_filter_config: Default::default(),
        };
        for Pass { kind, pass } in &mut self.passes {
            let Some(policy) = attached.get(kind) else {
                continue;
            };
            ctx.policy = Some(policy);
            if let Err(error) = pass.apply_for_route(&mut ctx, &mut out) {
                tracing::warn!(route = %route.source, rule = idx, policy = %kind, %error, "Dropping route rule");
                self.out
                    .diagnostics
                    .push(Diagnostic::new(route.source.clone(), error).with_rule(idx));
                return vec![];
            }
        }
        ctx.typed_filter_config
            .flush_into(&mut out.typed_per_filter_config);

        let mut clusters = Vec::with_capacity(rule.backends.len());
        for (backend_idx, backend_ref) in rule.backends.iter().enumerate() {
            let Some(backend) = backend_ref.backend.clone() else {
                tracing::debug!(route = %route.source, rule = idx, backend = %backend_ref.backend_ref, "Backend not found");
                self.out.diagnostics.push(
                    Diagnostic::new(route.source.clone(), "backend not found")
                        .with_rule(idx)
                        .with_backend(backend_ref.backend_ref.clone()),
                );
                continue;
            };
            let id = RouteBackendId {
                rule: id.clone(),
                backend: backend_idx,
            };

            let mut next = out.clone();
            match self.route_backend(&listener.name, backend_ref, &backend, &id, &mut next) {
                Ok(cluster) => {
                    out = next;
                    self.backends.entry(cluster.name.clone()).or_insert(backend);
                    clusters.push(cluster);
                }
                Err(error) => {
                    tracing::warn!(route = %route.source, rule = idx, backend = %backend_ref.backend_ref, %error, "Dropping backend");
                    self.out.diagnostics.push(
                        Diagnostic::new(route.source.clone(), error)
                            .with_rule(idx)
                            .with_backend(backend_ref.backend_ref.clone()),
                    );
                }
            }
        }

        if clusters.is_empty() {
            out.route = None;
            out.direct_response = Some(DirectResponseAction {
                status: DIRECT_RESPONSE_STATUS,
                body: None,
            });
        } else {
            out.route_action_mut().weighted_clusters.clusters = clusters;
        }

        let default_match = [HttpRouteMatch::prefix("/")];
        let matches = if rule.matches.is_empty() {
            &default_match[..]
        } else {
            &rule.matches[..]
        };
        matches
            .iter()
            .map(|m| Route {
                route_match: route_match(m),
                ..out.clone()
            })
            .collect()
    }

    fn route_backend(
        &mut self,
        filter_chain_name: &str,
        backend_ref: &BackendRefIr,
        backend: &BackendObjectIr,
        id: &RouteBackendId,
        route: &mut Route,
    ) -> Result<ClusterWeight, PassError> {
        let policies = self.policies;
        let attached = policies.route_backend(id);

        let mut ctx = RouteBackendContext::new(filter_chain_name, &self.ctx, backend_ref);
        for Pass { pass, .. } in &mut self.passes {
            pass.apply_for_backend(&mut ctx, route)?;
        }
        for Pass { kind, pass } in &mut self.passes {
            if let Some(policy) = attached.get(kind) {
                pass.apply_for_route_backend(policy, &mut ctx)?;
            }
        }

        let mut cluster = ClusterWeight {
            name: backend.cluster_name(),
            weight: backend_ref.weight,
            host_rewrite_literal: ctx.host_rewrite_literal,
            request_headers_to_add: ctx.request_headers_to_add,
            request_headers_to_remove: ctx.request_headers_to_remove,
            response_headers_to_add: ctx.response_headers_to_add,
            response_headers_to_remove: ctx.response_headers_to_remove,
            typed_per_filter_config: Default::default(),
        };
        ctx.typed_filter_config
            .flush_into(&mut cluster.typed_per_filter_config);
        Ok(cluster)
    }

    /// Collects the HTTP filters for a filter chain, ordered by stage and then
    /// name, with the router last.
    fn http_filters(&mut self, filter_chain: &FilterChainCommon) -> Vec<HttpFilter> {
        let gateway = self.gateway;
        let mut staged = Vec::new();
        for Pass { kind, pass } in &mut self.passes {
            match pass.http_filters(filter_chain) {
                Ok(filters) => staged.extend(filters),
                Err(error) => self
                    .out
                    .diagnostics
                    .push(plugin_diagnostic(gateway, kind, &error)),
            }
        }
        staged.sort_by(|a, b| {
            a.stage
                .cmp(&b.stage)
                .then_with(|| a.filter.name.cmp(&b.filter.name))
        });

        let mut names = BTreeSet::new();
        let mut filters = staged
            .into_iter()
            .filter(|f| f.filter.name != ROUTER_FILTER_NAME)
            .filter(|f| names.insert(f.filter.name.clone()))
            .map(|f| f.filter)
            .collect::<Vec<_>>();
        filters.push(HttpFilter::router());
        filters
    }

    fn network_filters(&mut self) -> Vec<NetworkFilter> {
        let gateway = self.gateway;
        let mut staged = Vec::new();
        for Pass { kind, pass } in &mut self.passes {
            match pass.network_filters() {
                Ok(filters) => staged.extend(filters),
                Err(error) => self
                    .out
                    .diagnostics
                    .push(plugin_diagnostic(gateway, kind, &error)),
            }
        }
        staged.sort_by(|a, b| {
            a.stage
                .cmp(&b.stage)
                .then_with(|| a.filter.name.cmp(&b.filter.name))
        });
        let mut names = BTreeSet::new();
        staged
            .into_iter()
            .filter(|f| names.insert(f.filter.name.clone()))
            .map(|f| f.filter)
            .collect()
    }

    /// Builds a cluster for every backend referenced by an emitted route.
    fn clusters(&mut self) {
        let registry = self.registry;
        let policies = self.policies;
        for (name, backend) in std::mem::take(&mut self.backends) {
            let attached = policies.backend(&backend);
            let mut cluster = Cluster::new(&name, &backend.address, backend.port);
            for plugin in registry.plugins() {
                let kind = &plugin.kind_info().kind;
                let mut next = cluster.clone();
                match plugin.process_backend(attached.get(kind), &backend, &mut next) {
                    Ok(()) => cluster = next,
                    Err(error) => {
                        tracing::warn!(backend = %backend.source, policy = %kind, %error, "Failed to configure backend");
                        self.out.diagnostics.push(
                            Diagnostic::new(backend.source.clone(), format!("{kind}: {error}")),
                        );
                    }
                }
            }
            self.out.clusters.insert(name, cluster);
        }
    }

    fn resources(&mut self) {
        for Pass { kind, pass } in &mut self.passes {
            for cluster in pass.resources_to_add().clusters {
                if self.out.clusters.contains_key(&cluster.name) {
                    tracing::debug!(cluster = %cluster.name, policy = %kind, "Ignoring duplicate cluster");
                    continue;
                }
                self.out.clusters.insert(cluster.name.clone(), cluster);
            }
        }
    }
}

fn plugin_diagnostic(gateway: &GatewayIr, kind: &PolicyKind, error: &PassError) -> Diagnostic {
    tracing::warn!(gateway = %gateway.source, policy = %kind, %error, "Skipping plugin output");
    Diagnostic::new(gateway.source.clone(), format!("{kind}: {error}"))
}

fn route_match(m: &HttpRouteMatch) -> RouteMatch {
    let mut out = RouteMatch::default();
    match &m.path {
        None => out.prefix = Some("/".to_string()),
        Some(PathMatch::Exact(path)) => out.path = Some(path.clone()),
        Some(PathMatch::Prefix(prefix)) => out.prefix = Some(prefix.clone()),
        Some(PathMatch::Regex(regex)) => {
            out.safe_regex = Some(RegexMatcher {
                regex: regex.as_str().to_string(),
            })
        }
    }
    out.headers = m
        .headers
        .iter()
        .map(|h| HeaderMatcher {
            name: h.name().to_string(),
            string_match: match h {
                HeaderMatch::Exact(_, value) => StringMatcher::Exact(value.clone()),
                HeaderMatch::Regex(_, regex) => StringMatcher::SafeRegex(RegexMatcher {
                    regex: regex.as_str().to_string(),
                }),
            },
        })
        .collect();
    if let Some(method) = &m.method {
        out.headers.push(HeaderMatcher {
            name: ":method".to_string(),
            string_match: StringMatcher::Exact(method.clone()),
        });
    }
    out
}
