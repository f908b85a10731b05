use super::{downcast, kind_info, parse_duration, wrap};
use chrono::{DateTime, Utc};
use gateway_policy_controller_core::{
    ir::BackendObjectIr,
    ir_equals,
    pass::{GatewayContext, PassError, ProxyTranslationPass, RouteBackendContext},
    proxy::{Cluster, Route},
    raw::RawPolicy,
    Plugin, PolicyError, PolicyIr, PolicyKindInfo, PolicyWrapper,
};
use std::{any::Any, sync::Arc, time::Duration};

/// Upstream connection settings for backends.
///
/// Policies of this kind never merge: the highest priority policy targeting a
/// backend configures its cluster.
pub struct BackendConfigPlugin {
    info: PolicyKindInfo,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackendConfigPolicyIr {
    pub created: DateTime<Utc>,
    pub connect_timeout: Option<Duration>,
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

#[derive(Debug, Default)]
struct BackendConfigPass;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Spec {
    #[serde(default)]
    connect_timeout: Option<String>,
    #[serde(default)]
    per_connection_buffer_limit_bytes: Option<u32>,
}

// === impl BackendConfigPlugin ===

impl Default for BackendConfigPlugin {
    fn default() -> Self {
        Self {
            info: kind_info("BackendConfigPolicy", "backendconfigpolicies"),
        }
    }
}

impl Plugin for BackendConfigPlugin {
    fn kind_info(&self) -> &PolicyKindInfo {
        &self.info
    }

    fn build_policy(&self, raw: &RawPolicy) -> anyhow::Result<PolicyWrapper> {
        let mut errors = Vec::new();
        let spec = raw.spec::<Spec>().unwrap_or_else(|error| {
            errors.push(error);
            Spec::default()
        });
        let connect_timeout = parse_duration(
            "connectTimeout",
            spec.connect_timeout.as_deref(),
            &mut errors,
        );
        if connect_timeout.is_some_and(|t| t.is_zero()) {
            errors.push(PolicyError::invalid_field(
                "connectTimeout",
                "must be greater than zero",
            ));
        }

        let ir = BackendConfigPolicyIr {
            created: raw.creation_time(),
            connect_timeout: connect_timeout.filter(|t| !t.is_zero()),
            per_connection_buffer_limit_bytes: spec.per_connection_buffer_limit_bytes,
        };
        wrap(raw, Arc::new(ir), errors)
    }

    fn new_translation_pass(&self, _: &GatewayContext) -> Box<dyn ProxyTranslationPass> {
        Box::<BackendConfigPass>::default()
    }

    fn process_backend(
        &self,
        policy: Option<&dyn PolicyIr>,
        _backend: &BackendObjectIr,
        out: &mut Cluster,
    ) -> Result<(), PassError> {
        let Some(policy) = policy else {
            return Ok(());
        };
        let policy = downcast::<BackendConfigPolicyIr>(policy)?;
        if let Some(timeout) = policy.connect_timeout {
            out.connect_timeout = timeout;
        }
        if policy.per_connection_buffer_limit_bytes.is_some() {
            out.per_connection_buffer_limit_bytes = policy.per_connection_buffer_limit_bytes;
        }
        Ok(())
    }
}

// === impl BackendConfigPolicyIr ===

impl PolicyIr for BackendConfigPolicyIr {
    fn creation_time(&self) -> DateTime<Utc> {
        self.created
    }

    fn equals(&self, other: &dyn PolicyIr) -> bool {
        ir_equals(self, other)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// === impl BackendConfigPass ===

impl ProxyTranslationPass for BackendConfigPass {
    /// Backends that must be addressed by a specific authority get the host
    /// header rewritten, whether or not a policy is attached.
    fn apply_for_backend(
        &mut self,
        ctx: &mut RouteBackendContext<'_>,
        _out: &mut Route,
    ) -> Result<(), PassError> {
        if let Some(authority) = ctx
            .backend
            .backend
            .as_ref()
            .and_then(|b| b.authority.as_ref())
        {
            ctx.host_rewrite_literal = Some(authority.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_policy_controller_core::{
        ir::BackendRefIr, proxy::DEFAULT_CONNECT_TIMEOUT, raw::ObjectMeta, ObjectSource,
    };
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn backend(authority: Option<&str>) -> Arc<BackendObjectIr> {
        Arc::new(BackendObjectIr {
            source: ObjectSource::new("", "Service", "default", "httpbin"),
            port: 8000,
            address: "httpbin.default.svc.cluster.local".to_string(),
            authority: authority.map(ToString::to_string),
        })
    }

    fn raw(spec: serde_json::Value) -> RawPolicy {
        RawPolicy {
            api_version: "policy.gateway.dev/v1alpha1".to_string(),
            kind: "BackendConfigPolicy".to_string(),
            metadata: ObjectMeta {
                name: "bcp".to_string(),
                namespace: "default".to_string(),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    #[rstest]
    #[case(serde_json::json!({ "connectTimeout": "0s" }))]
    #[case(serde_json::json!({ "connectTimeout": "-1s" }))]
    #[case(serde_json::json!({ "perConnectionBufferLimitBytes": "lots" }))]
    fn rejects_invalid_specs(#[case] spec: serde_json::Value) {
        let policy = BackendConfigPlugin::default().build_policy(&raw(spec)).unwrap();
        assert!(!policy.is_valid());
    }

    #[test]
    fn configures_cluster() {
        let plugin = BackendConfigPlugin::default();
        let policy = plugin
            .build_policy(&raw(serde_json::json!({
                "connectTimeout": "250ms",
                "perConnectionBufferLimitBytes": 1024,
            })))
            .unwrap();
        assert!(policy.is_valid());

        let backend = backend(None);
        let mut cluster = Cluster::new(backend.cluster_name(), &backend.address, backend.port);
        plugin
            .process_backend(None, &backend, &mut cluster)
            .unwrap();
        assert_eq!(cluster.connect_timeout, DEFAULT_CONNECT_TIMEOUT);

        plugin
            .process_backend(Some(&*policy.policy_ir), &backend, &mut cluster)
            .unwrap();
        assert_eq!(cluster.connect_timeout, Duration::from_millis(250));
        assert_eq!(cluster.per_connection_buffer_limit_bytes, Some(1024));
    }

    #[test]
    fn rewrites_host_for_backends_with_an_authority() {
        let gateway = GatewayContext {
            gateway: ObjectSource::new(
                "gateway.networking.k8s.io",
                "Gateway",
                "default",
                "example-gateway",
            ),
            class_name: "example".to_string(),
        };
        let mut pass = BackendConfigPass;
        let mut route = Route::default();

        for (authority, expected) in [(None, None), (Some("httpbin.org"), Some("httpbin.org"))] {
            let backend = backend(authority);
            let backend_ref = BackendRefIr {
                backend_ref: backend.source.clone(),
                backend: Some(backend),
                weight: 1,
                extension_refs: vec![],
            };
            let mut ctx = RouteBackendContext::new("http", &gateway, &backend_ref);
            pass.apply_for_backend(&mut ctx, &mut route).unwrap();
            assert_eq!(ctx.host_rewrite_literal.as_deref(), expected);
        }
    }
}
