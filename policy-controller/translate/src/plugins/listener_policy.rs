use super::{downcast, downcast_all, kind_info, merge_field, parse_duration, wrap};
use chrono::{DateTime, Utc};
use gateway_policy_controller_core::{
    ir_equals,
    pass::{GatewayContext, HcmContext, ListenerContext, PassError, ProxyTranslationPass},
    proxy::{HttpConnectionManager, Listener},
    raw::RawPolicy,
    MergedPolicy, Plugin, PolicyError, PolicyIr, PolicyKindInfo, PolicyWrapper, SharedPolicyIr,
};
use std::{any::Any, sync::Arc, time::Duration};

/// Connection-level settings for a gateway's HTTP listeners.
pub struct HttpListenerPlugin {
    info: PolicyKindInfo,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct HttpListenerPolicyIr {
    pub created: DateTime<Utc>,
    pub use_remote_address: Option<bool>,
    pub xff_num_trusted_hops: Option<u32>,
    pub server_name: Option<String>,
    pub server_header_transformation: Option<String>,
    pub stream_idle_timeout: Option<Duration>,
    pub per_connection_buffer_limit_bytes: Option<u32>,
}

#[derive(Debug, Default)]
struct HttpListenerPass;

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Spec {
    #[serde(default)]
    use_remote_address: Option<bool>,
    #[serde(default)]
    xff_num_trusted_hops: Option<u32>,
    #[serde(default)]
    server_name: Option<String>,
    #[serde(default)]
    server_header_transformation: Option<String>,
    #[serde(default)]
    stream_idle_timeout: Option<String>,
    #[serde(default)]
    per_connection_buffer_limit_bytes: Option<u32>,
}

// === impl HttpListenerPlugin ===

impl Default for HttpListenerPlugin {
    fn default() -> Self {
        Self {
            info: kind_info("HTTPListenerPolicy", "httplistenerpolicies"),
        }
    }
}

impl Plugin for HttpListenerPlugin {
    fn kind_info(&self) -> &PolicyKindInfo {
        &self.info
    }

    fn build_policy(&self, raw: &RawPolicy) -> anyhow::Result<PolicyWrapper> {
        let mut errors = Vec::new();
        let spec = raw.spec::<Spec>().unwrap_or_else(|error| {
            errors.push(error);
            Spec::default()
        });

        let server_header_transformation = spec.server_header_transformation.and_then(|t| {
            match parse_header_transformation(&t) {
                Some(t) => Some(t.to_string()),
                None => {
                    errors.push(PolicyError::invalid_field(
                        "serverHeaderTransformation",
                        format!("unknown value {t:?}"),
                    ));
                    None
                }
            }
        });
        let stream_idle_timeout = parse_duration(
            "streamIdleTimeout",
            spec.stream_idle_timeout.as_deref(),
            &mut errors,
        );

        let ir = HttpListenerPolicyIr {
            created: raw.creation_time(),
            use_remote_address: spec.use_remote_address,
            xff_num_trusted_hops: spec.xff_num_trusted_hops,
            server_name: spec.server_name,
            server_header_transformation,
            stream_idle_timeout,
            per_connection_buffer_limit_bytes: spec.per_connection_buffer_limit_bytes,
        };
        wrap(raw, Arc::new(ir), errors)
    }

    fn new_translation_pass(&self, _: &GatewayContext) -> Box<dyn ProxyTranslationPass> {
        Box::<HttpListenerPass>::default()
    }

    fn merges(&self) -> bool {
        true
    }

    fn merge_policies(&self, policies: &[SharedPolicyIr]) -> Option<MergedPolicy> {
        let irs = downcast_all::<HttpListenerPolicyIr>(policies)?;
        let mut contributed = vec![false; irs.len()];
        let merged = HttpListenerPolicyIr {
            created: irs.iter().map(|ir| ir.created).min()?,
            use_remote_address: merge_field(&irs, &mut contributed, |ir| &ir.use_remote_address),
            xff_num_trusted_hops: merge_field(&irs, &mut contributed, |ir| {
                &ir.xff_num_trusted_hops
            }),
            server_name: merge_field(&irs, &mut contributed, |ir| &ir.server_name),
            server_header_transformation: merge_field(&irs, &mut contributed, |ir| {
                &ir.server_header_transformation
            }),
            stream_idle_timeout: merge_field(&irs, &mut contributed, |ir| {
                &ir.stream_idle_timeout
            }),
            per_connection_buffer_limit_bytes: merge_field(&irs, &mut contributed, |ir| {
                &ir.per_connection_buffer_limit_bytes
            }),
        };
        if let Some(last) = contributed.last_mut() {
            *last = true;
        }
        Some(MergedPolicy {
            policy: Arc::new(merged),
            contributed,
        })
    }
}

fn parse_header_transformation(value: &str) -> Option<&'static str> {
    match value {
        "Overwrite" => Some("OVERWRITE"),
        "AppendIfAbsent" => Some("APPEND_IF_ABSENT"),
        "PassThrough" => Some("PASS_THROUGH"),
        _ => None,
    }
}

// === impl HttpListenerPolicyIr ===

impl PolicyIr for HttpListenerPolicyIr {
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

// === impl HttpListenerPass ===

impl ProxyTranslationPass for HttpListenerPass {
    fn apply_listener_plugin(&mut self, ctx: &ListenerContext<'_>, out: &mut Listener) {
        let Some(policy) = ctx.policy else {
            return;
        };
        match downcast::<HttpListenerPolicyIr>(policy) {
            Ok(policy) => {
                if let Some(limit) = policy.per_connection_buffer_limit_bytes {
                    out.per_connection_buffer_limit_bytes = Some(limit);
                }
            }
            Err(error) => {
                tracing::debug!(listener = %ctx.listener.name, %error, "Ignoring listener policy");
            }
        }
    }

    fn apply_hcm(
        &mut self,
        ctx: &HcmContext<'_>,
        out: &mut HttpConnectionManager,
    ) -> Result<(), PassError> {
        let Some(policy) = ctx.policy else {
            return Ok(());
        };
        let policy = downcast::<HttpListenerPolicyIr>(policy)?;
        if policy.use_remote_address.is_some() {
            out.use_remote_address = policy.use_remote_address;
        }
        if policy.xff_num_trusted_hops.is_some() {
            out.xff_num_trusted_hops = policy.xff_num_trusted_hops;
        }
        if policy.server_name.is_some() {
            out.server_name.clone_from(&policy.server_name);
        }
        if policy.server_header_transformation.is_some() {
            out.server_header_transformation
                .clone_from(&policy.server_header_transformation);
        }
        if policy.stream_idle_timeout.is_some() {
            out.stream_idle_timeout = policy.stream_idle_timeout;
        }
        Ok(())
    }
}
