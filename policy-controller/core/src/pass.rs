use crate::{
    ir::{BackendRefIr, GatewayIr, HttpRouteIr, ListenerIr, RouteRuleIr},
    proxy::{
        Cluster, HeaderValueOption, HttpConnectionManager, HttpFilter, Listener, NetworkFilter,
        Route, RouteConfiguration, VirtualHost,
    },
    InheritedPolicyPriority, ObjectSource, PolicyError, PolicyIr, TypedFilterConfigMap,
};

/// Identifies the gateway a translation pass is created for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GatewayContext {
    pub gateway: ObjectSource,
    pub class_name: String,
}

pub struct ListenerContext<'a> {
    pub policy: Option<&'a dyn PolicyIr>,
    pub listener: &'a ListenerIr,
    pub gateway: &'a GatewayContext,
}

pub struct RouteConfigContext<'a> {
    pub filter_chain_name: &'a str,
    pub gateway: &'a GatewayContext,
    pub typed_filter_config: TypedFilterConfigMap,
}

pub struct RouteContext<'a> {
    /// The effective policy of the running pass's kind for this rule.
    pub policy: Option<&'a dyn PolicyIr>,
    pub filter_chain_name: &'a str,
    pub gateway: &'a GatewayContext,
    pub listener: &'a ListenerIr,
    pub route: &'a HttpRouteIr,
    pub rule: &'a RouteRuleIr,
    pub inherited_policy_priority: InheritedPolicyPriority,
    pub typed_filter_config: TypedFilterConfigMap,
}

/// Collects the per-backend output of a route rule. Everything here is
/// written to the backend's weighted cluster entry.
pub struct RouteBackendContext<'a> {
    pub filter_chain_name: &'a str,
    pub gateway: &'a GatewayContext,
    pub backend: &'a BackendRefIr,
    pub typed_filter_config: TypedFilterConfigMap,
    pub host_rewrite_literal: Option<String>,
    pub request_headers_to_add: Vec<HeaderValueOption>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<HeaderValueOption>,
    pub response_headers_to_remove: Vec<String>,
}

pub struct VirtualHostContext<'a> {
    pub policy: Option<&'a dyn PolicyIr>,
    pub filter_chain_name: &'a str,
    pub gateway: &'a GatewayContext,
    pub typed_filter_config: TypedFilterConfigMap,
}

pub struct HcmContext<'a> {
    pub policy: Option<&'a dyn PolicyIr>,
    pub gateway: &'a GatewayIr,
    pub listener: &'a ListenerIr,
}

/// Describes the filter chain whose filters are being collected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterChainCommon {
    pub name: String,
    pub listener: String,
    pub port: u16,
}

/// Well-known positions in the HTTP filter chain, in chain order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WellKnownFilterStage {
    Fault,
    Cors,
    Waf,
    AuthN,
    AuthZ,
    RateLimit,
    Accepted,
    OutAuth,
    Route,
}

/// A position in the filter chain relative to a well-known stage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterStage {
    pub stage: WellKnownFilterStage,
    pub weight: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StagedHttpFilter {
    pub stage: FilterStage,
    pub filter: HttpFilter,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StagedNetworkFilter {
    pub stage: FilterStage,
    pub filter: NetworkFilter,
}

/// Proxy-level resources a pass contributes in addition to those derived from
/// backends.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resources {
    pub clusters: Vec<Cluster>,
}

/// A failure while applying a policy to a route, backend, or filter chain.
///
/// The message is shown to users, so it must not carry internal details.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct PassError {
    message: String,
}

/// One plugin's contribution to the translation of a single gateway.
///
/// A pass is created per gateway per translation cycle and its hooks are
/// invoked in pipeline order by a single thread, so a pass may carry state
/// from earlier hooks into later ones (e.g. to emit a filter only when some
/// route enabled it). Every hook defaults to doing nothing.
pub trait ProxyTranslationPass: Send {
    /// Called once per listener.
    fn apply_listener_plugin(&mut self, _ctx: &ListenerContext<'_>, _out: &mut Listener) {}

    /// Called once per route table.
    fn apply_route_config_plugin(
        &mut self,
        _ctx: &mut RouteConfigContext<'_>,
        _out: &mut RouteConfiguration,
    ) {
    }

    /// Called for every backend of every rule, whether or not a policy is
    /// attached. Configuration derived from the backend's identity goes here.
    fn apply_for_backend(
        &mut self,
        _ctx: &mut RouteBackendContext<'_>,
        _out: &mut Route,
    ) -> Result<(), PassError> {
        Ok(())
    }

    /// Called for a backend reference that has a policy of this pass's kind
    /// attached.
    fn apply_for_route_backend(
        &mut self,
        _policy: &dyn PolicyIr,
        _ctx: &mut RouteBackendContext<'_>,
    ) -> Result<(), PassError> {
        Ok(())
    }

    /// Called for a route rule that has a policy of this pass's kind attached.
    /// An error drops the rule from the output.
    fn apply_for_route(
        &mut self,
        _ctx: &mut RouteContext<'_>,
        _out: &mut Route,
    ) -> Result<(), PassError> {
        Ok(())
    }

    /// Called once per virtual host, after its routes are built.
    fn apply_vhost_plugin(&mut self, _ctx: &mut VirtualHostContext<'_>, _out: &mut VirtualHost) {}

    fn network_filters(&mut self) -> Result<Vec<StagedNetworkFilter>, PassError> {
        Ok(vec![])
    }

    /// Returns the HTTP filters this pass needs on a filter chain. Filters
    /// that only apply to some routes should be returned disabled and enabled
    /// through per-route configuration.
    fn http_filters(
        &mut self,
        _filter_chain: &FilterChainCommon,
    ) -> Result<Vec<StagedHttpFilter>, PassError> {
        Ok(vec![])
    }

    fn apply_hcm(
        &mut self,
        _ctx: &HcmContext<'_>,
        _out: &mut HttpConnectionManager,
    ) -> Result<(), PassError> {
        Ok(())
    }

    /// Called once per gateway, after every other hook.
    fn resources_to_add(&mut self) -> Resources {
        Resources::default()
    }
}

/// A pass that does nothing, for plugins that only contribute through
/// `process_backend`.
#[derive(Copy, Clone, Debug, Default)]
pub struct UnimplementedProxyTranslationPass;

impl ProxyTranslationPass for UnimplementedProxyTranslationPass {}

// === impl RouteBackendContext ===

impl<'a> RouteBackendContext<'a> {
    pub fn new(
        filter_chain_name: &'a str,
        gateway: &'a GatewayContext,
        backend: &'a BackendRefIr,
    ) -> Self {
        Self {
            filter_chain_name,
            gateway,
            backend,
            typed_filter_config: TypedFilterConfigMap::default(),
            host_rewrite_literal: None,
            request_headers_to_add: vec![],
            request_headers_to_remove: vec![],
            response_headers_to_add: vec![],
            response_headers_to_remove: vec![],
        }
    }
}

// === impl FilterStage ===

impl FilterStage {
    pub fn before(stage: WellKnownFilterStage) -> Self {
        Self { stage, weight: -1 }
    }

    pub fn during(stage: WellKnownFilterStage) -> Self {
        Self { stage, weight: 0 }
    }

    pub fn after(stage: WellKnownFilterStage) -> Self {
        Self { stage, weight: 1 }
    }
}

// === impl PassError ===

impl PassError {
    pub fn new(message: impl ToString) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<PolicyError> for PassError {
    fn from(error: PolicyError) -> Self {
        Self::new(error)
    }
}
