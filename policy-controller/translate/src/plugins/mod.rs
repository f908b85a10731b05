//! Built-in policy kinds.

mod backend_config;
mod listener_policy;
mod traffic_policy;

pub use self::{
    backend_config::{BackendConfigPlugin, BackendConfigPolicyIr},
    listener_policy::{HttpListenerPlugin, HttpListenerPolicyIr},
    traffic_policy::{
        HeaderModifiers, LocalRateLimit, TrafficPolicyIr, TrafficPolicyPlugin,
        LOCAL_RATELIMIT_FILTER_NAME, LOCAL_RATELIMIT_TYPE_URL,
    },
};

use gateway_policy_controller_core::{
    pass::PassError, raw::RawPolicy, PolicyError, PolicyIr, PolicyKind, PolicyKindInfo,
    PolicyWrapper, SharedPolicyIr, POLICY_API_GROUP,
};
use gateway_policy_controller_index::{DuplicateKind, PolicyRegistry};
use gateway_policy_controller_k8s_api::PolicyDuration;
use std::{sync::Arc, time::Duration};

pub const POLICY_API_VERSION: &str = "v1alpha1";

#[derive(Clone, Debug, Default)]
pub struct PluginConfig {
    /// When set, only the highest priority TrafficPolicy applies to a target.
    pub disable_traffic_policy_merge: bool,
}

/// Builds a registry holding every built-in plugin.
pub fn registry(config: &PluginConfig) -> Result<PolicyRegistry, DuplicateKind> {
    let mut registry = PolicyRegistry::default();
    registry.register(Arc::new(TrafficPolicyPlugin::new(
        !config.disable_traffic_policy_merge,
    )))?;
    registry.register(Arc::new(HttpListenerPlugin::default()))?;
    registry.register(Arc::new(BackendConfigPlugin::default()))?;
    Ok(registry)
}

fn kind_info(kind: &str, plural: &str) -> PolicyKindInfo {
    PolicyKindInfo {
        kind: PolicyKind::new(POLICY_API_GROUP, kind),
        version: POLICY_API_VERSION.to_string(),
        plural: plural.to_string(),
    }
}

/// Wraps a plugin's IR along with the errors found while building it.
///
/// Only an unreadable target list fails outright: without targets the policy
/// can't be reported anywhere.
fn wrap(
    raw: &RawPolicy,
    policy_ir: SharedPolicyIr,
    mut errors: Vec<PolicyError>,
) -> anyhow::Result<PolicyWrapper> {
    let target_refs = raw.target_refs()?;
    let precedence_weight = raw.precedence_weight().unwrap_or_else(|error| {
        errors.push(error);
        0
    });
    Ok(PolicyWrapper {
        source: raw.source(),
        version: raw.version(),
        errors,
        target_refs,
        policy_ir,
        precedence_weight,
    })
}

fn downcast<T: PolicyIr>(policy: &dyn PolicyIr) -> Result<&T, PassError> {
    policy
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| PassError::new("unexpected policy type"))
}

fn downcast_all<T: PolicyIr>(policies: &[SharedPolicyIr]) -> Option<Vec<&T>> {
    policies
        .iter()
        .map(|p| p.as_any().downcast_ref::<T>())
        .collect()
}

/// Picks the highest priority value of an optional field, marking the input
/// that supplied it.
fn merge_field<I, T: Clone>(
    irs: &[&I],
    contributed: &mut [bool],
    field: impl Fn(&I) -> &Option<T>,
) -> Option<T> {
    let (idx, value) = irs
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, ir)| field(ir).as_ref().map(|v| (i, v)))?;
    contributed[idx] = true;
    Some(value.clone())
}

fn parse_duration(
    field: &str,
    value: Option<&str>,
    errors: &mut Vec<PolicyError>,
) -> Option<Duration> {
    let value = value?;
    match value.parse::<PolicyDuration>() {
        Ok(d) => Some(d.as_duration()),
        Err(error) => {
            errors.push(PolicyError::invalid_field(field, error));
            None
        }
    }
}
