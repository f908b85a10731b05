use super::{downcast, downcast_all, kind_info, merge_field, parse_duration, wrap};
use chrono::{DateTime, Utc};
use gateway_policy_controller_core::{
    ir_equals,
    pass::{
        FilterChainCommon, FilterStage, GatewayContext, PassError, ProxyTranslationPass,
        RouteContext, StagedHttpFilter, WellKnownFilterStage,
    },
    proxy::{format_duration, HeaderValueOption, HttpFilter, Route, TypedConfig},
    raw::RawPolicy,
    MergedPolicy, Plugin, PolicyError, PolicyIr, PolicyKindInfo, PolicyWrapper, SharedPolicyIr,
};
use std::{any::Any, collections::BTreeSet, sync::Arc, time::Duration};

pub const LOCAL_RATELIMIT_FILTER_NAME: &str = "envoy.filters.http.local_ratelimit";
pub const LOCAL_RATELIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";

const LOCAL_RATELIMIT_STAT_PREFIX: &str = "http_local_rate_limiter";

/// Route-level traffic settings: request timeouts, header modifiers and a
/// local rate limit.
pub struct TrafficPolicyPlugin {
    info: PolicyKindInfo,
    merges: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TrafficPolicyIr {
    pub created: DateTime<Utc>,
    pub timeout: Option<Duration>,
    pub request_headers: Option<HeaderModifiers>,
    pub response_headers: Option<HeaderModifiers>,
    pub local_rate_limit: Option<LocalRateLimit>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderModifiers {
    pub set: Vec<(String, String)>,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LocalRateLimit {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval: Duration,
}

/// Tracks which filter chains have a rate-limited route so the filter is only
/// installed where it's used.
#[derive(Debug, Default)]
struct TrafficPolicyPass {
    rate_limited: BTreeSet<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct Spec {
    #[serde(default)]
    timeouts: Option<TimeoutsSpec>,
    #[serde(default)]
    header_modifiers: Option<HeaderModifiersSpec>,
    #[serde(default)]
    rate_limit: Option<RateLimitSpec>,
}

#[derive(Debug, serde::Deserialize)]
struct TimeoutsSpec {
    #[serde(default)]
    request: Option<String>,
}

#[derive(Debug, serde::Deserialize)]
struct HeaderModifiersSpec {
    #[serde(default)]
    request: Option<HeaderFilterSpec>,
    #[serde(default)]
    response: Option<HeaderFilterSpec>,
}

#[derive(Debug, serde::Deserialize)]
struct HeaderFilterSpec {
    #[serde(default)]
    set: Vec<HeaderSpec>,
    #[serde(default)]
    add: Vec<HeaderSpec>,
    #[serde(default)]
    remove: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct HeaderSpec {
    name: String,
    value: String,
}

#[derive(Debug, serde::Deserialize)]
struct RateLimitSpec {
    #[serde(default)]
    local: Option<LocalRateLimitSpec>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalRateLimitSpec {
    token_bucket: TokenBucketSpec,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenBucketSpec {
    max_tokens: u32,
    #[serde(default)]
    tokens_per_fill: Option<u32>,
    fill_interval: String,
}

#[derive(Debug, serde::Serialize)]
struct LocalRateLimitConfig {
    stat_prefix: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token_bucket: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_enabled: Option<RuntimeFractionalPercent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter_enforced: Option<RuntimeFractionalPercent>,
}

#[derive(Debug, serde::Serialize)]
struct TokenBucket {
    max_tokens: u32,
    tokens_per_fill: u32,
    fill_interval: String,
}

#[derive(Debug, serde::Serialize)]
struct RuntimeFractionalPercent {
    runtime_key: &'static str,
    default_value: FractionalPercent,
}

#[derive(Debug, serde::Serialize)]
struct FractionalPercent {
    numerator: u32,
    denominator: &'static str,
}

// === impl TrafficPolicyPlugin ===

impl TrafficPolicyPlugin {
    pub fn new(merges: bool) -> Self {
        Self {
            info: kind_info("TrafficPolicy", "trafficpolicies"),
            merges,
        }
    }
}

impl Plugin for TrafficPolicyPlugin {
    fn kind_info(&self) -> &PolicyKindInfo {
        &self.info
    }

    fn build_policy(&self, raw: &RawPolicy) -> anyhow::Result<PolicyWrapper> {
        let mut errors = Vec::new();
        let spec = raw.spec::<Spec>().unwrap_or_else(|error| {
            errors.push(error);
            Spec::default()
        });
        let ir = TrafficPolicyIr::from_spec(raw.creation_time(), spec, &mut errors);
        wrap(raw, Arc::new(ir), errors)
    }

    fn new_translation_pass(&self, _: &GatewayContext) -> Box<dyn ProxyTranslationPass> {
        Box::<TrafficPolicyPass>::default()
    }

    fn inherits(&self) -> bool {
        true
    }

    fn merges(&self) -> bool {
        self.merges
    }

    /// Merges field by field: each field takes the value of the highest
    /// priority policy that sets it.
    fn merge_policies(&self, policies: &[SharedPolicyIr]) -> Option<MergedPolicy> {
        let irs = downcast_all::<TrafficPolicyIr>(policies)?;
        let mut contributed = vec![false; irs.len()];
        let merged = TrafficPolicyIr {
            created: irs.iter().map(|ir| ir.created).min()?,
            timeout: merge_field(&irs, &mut contributed, |ir| &ir.timeout),
            request_headers: merge_field(&irs, &mut contributed, |ir| &ir.request_headers),
            response_headers: merge_field(&irs, &mut contributed, |ir| &ir.response_headers),
            local_rate_limit: merge_field(&irs, &mut contributed, |ir| &ir.local_rate_limit),
        };
        // The highest priority policy is never shadowed, even when empty.
        if let Some(last) = contributed.last_mut() {
            *last = true;
        }
        Some(MergedPolicy {
            policy: Arc::new(merged),
            contributed,
        })
    }
}

// === impl TrafficPolicyIr ===

impl PolicyIr for TrafficPolicyIr {
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

impl TrafficPolicyIr {
    fn from_spec(created: DateTime<Utc>, spec: Spec, errors: &mut Vec<PolicyError>) -> Self {
        let timeout = parse_duration(
            "timeouts.request",
            spec.timeouts.as_ref().and_then(|t| t.request.as_deref()),
            errors,
        );

        let (request_headers, response_headers) = match spec.header_modifiers {
            None => (None, None),
            Some(HeaderModifiersSpec { request, response }) => (
                request.map(|f| HeaderModifiers::from_spec("headerModifiers.request", f, errors)),
                response.map(|f| HeaderModifiers::from_spec("headerModifiers.response", f, errors)),
            ),
        };

        let local_rate_limit = spec
            .rate_limit
            .and_then(|rl| rl.local)
            .and_then(|local| LocalRateLimit::from_spec(local.token_bucket, errors));

        Self {
            created,
            timeout,
            request_headers,
            response_headers,
            local_rate_limit,
        }
    }
}

// === impl HeaderModifiers ===

impl HeaderModifiers {
    fn from_spec(field: &str, spec: HeaderFilterSpec, errors: &mut Vec<PolicyError>) -> Self {
        let mut headers = |list: Vec<HeaderSpec>| {
            list.into_iter()
                .filter(|HeaderSpec { name, value }| {
                    if let Err(error) = http::HeaderName::from_bytes(name.as_bytes()) {
                        errors.push(PolicyError::invalid_field(field, error));
                        return false;
                    }
                    if let Err(error) = http::HeaderValue::from_str(value) {
                        errors.push(PolicyError::invalid_field(field, error));
                        return false;
                    }
                    true
                })
                .map(|HeaderSpec { name, value }| (name, value))
                .collect::<Vec<_>>()
        };
        let set = headers(spec.set);
        let add = headers(spec.add);

        let remove = spec
            .remove
            .into_iter()
            .filter(|name| match http::HeaderName::from_bytes(name.as_bytes()) {
                Ok(_) => true,
                Err(error) => {
                    errors.push(PolicyError::invalid_field(field, error));
                    false
                }
            })
            .collect();

        Self { set, add, remove }
    }

    fn apply(&self, add: &mut Vec<HeaderValueOption>, remove: &mut Vec<String>) {
        add.extend(
            self.set
                .iter()
                .map(|(name, value)| HeaderValueOption::overwrite(name, value)),
        );
        add.extend(
            self.add
                .iter()
                .map(|(name, value)| HeaderValueOption::append(name, value)),
        );
        remove.extend(self.remove.iter().cloned());
    }
}

// === impl LocalRateLimit ===

impl LocalRateLimit {
    fn from_spec(spec: TokenBucketSpec, errors: &mut Vec<PolicyError>) -> Option<Self> {
        let field = "rateLimit.local.tokenBucket";
        if spec.max_tokens == 0 {
            errors.push(PolicyError::invalid_field(
                field,
                "maxTokens must be greater than zero",
            ));
            return None;
        }
        let fill_interval = parse_duration(
            "rateLimit.local.tokenBucket.fillInterval",
            Some(spec.fill_interval.as_str()),
            errors,
        )?;
        if fill_interval.is_zero() {
            errors.push(PolicyError::invalid_field(
                field,
                "fillInterval must be greater than zero",
            ));
            return None;
        }
        Some(Self {
            max_tokens: spec.max_tokens,
            tokens_per_fill: spec.tokens_per_fill.unwrap_or(1),
            fill_interval,
        })
    }

    fn route_config(&self) -> LocalRateLimitConfig {
        let enabled = || RuntimeFractionalPercent {
            runtime_key: "local_rate_limit_enabled",
            default_value: FractionalPercent {
                numerator: 100,
                denominator: "HUNDRED",
            },
        };
        LocalRateLimitConfig {
            stat_prefix: LOCAL_RATELIMIT_STAT_PREFIX,
            token_bucket: Some(TokenBucket {
                max_tokens: self.max_tokens,
                tokens_per_fill: self.tokens_per_fill,
                fill_interval: format_duration(self.fill_interval),
            }),
            filter_enabled: Some(enabled()),
            filter_enforced: Some(enabled()),
        }
    }
}

// === impl TrafficPolicyPass ===

impl ProxyTranslationPass for TrafficPolicyPass {
    fn apply_for_route(
        &mut self,
        ctx: &mut RouteContext<'_>,
        out: &mut Route,
    ) -> Result<(), PassError> {
        let Some(policy) = ctx.policy else {
            return Ok(());
        };
        let policy = downcast::<TrafficPolicyIr>(policy)?;

        if let Some(timeout) = policy.timeout {
            out.route_action_mut().timeout = Some(timeout);
        }
        if let Some(headers) = &policy.request_headers {
            headers.apply(
                &mut out.request_headers_to_add,
                &mut out.request_headers_to_remove,
            );
        }
        if let Some(headers) = &policy.response_headers {
            headers.apply(
                &mut out.response_headers_to_add,
                &mut out.response_headers_to_remove,
            );
        }
        if let Some(rl) = &policy.local_rate_limit {
            let config = TypedConfig::encode(LOCAL_RATELIMIT_TYPE_URL, &rl.route_config())
                .map_err(|_| PassError::new("failed to encode local rate limit"))?;
            ctx.typed_filter_config
                .add_typed_config(LOCAL_RATELIMIT_FILTER_NAME, config);
            self.rate_limited.insert(ctx.filter_chain_name.to_string());
        }
        Ok(())
    }

    fn http_filters(
        &mut self,
        filter_chain: &FilterChainCommon,
    ) -> Result<Vec<StagedHttpFilter>, PassError> {
        if !self.rate_limited.contains(&filter_chain.name) {
            return Ok(vec![]);
        }

        // Installed disabled so that only routes carrying a per-route config
        // are limited.
        let config = LocalRateLimitConfig {
            stat_prefix: LOCAL_RATELIMIT_STAT_PREFIX,
            token_bucket: None,
            filter_enabled: None,
            filter_enforced: None,
        };
        let typed_config = TypedConfig::encode(LOCAL_RATELIMIT_TYPE_URL, &config)
            .map_err(|_| PassError::new("failed to encode local rate limit"))?;
        Ok(vec![StagedHttpFilter {
            stage: FilterStage::during(WellKnownFilterStage::RateLimit),
            filter: HttpFilter {
                name: LOCAL_RATELIMIT_FILTER_NAME.to_string(),
                typed_config,
                disabled: true,
            },
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_policy_controller_core::raw::ObjectMeta;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn raw(spec: serde_json::Value) -> RawPolicy {
        RawPolicy {
            api_version: "policy.gateway.dev/v1alpha1".to_string(),
            kind: "TrafficPolicy".to_string(),
            metadata: ObjectMeta {
                name: "tp".to_string(),
                namespace: "default".to_string(),
                generation: 1,
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    fn ir(policy: &PolicyWrapper) -> &TrafficPolicyIr {
        policy
            .policy_ir
            .as_any()
            .downcast_ref::<TrafficPolicyIr>()
            .expect("policy must be a TrafficPolicy")
    }

    #[test]
    fn builds_a_complete_policy() {
        let policy = TrafficPolicyPlugin::new(true)
            .build_policy(&raw(serde_json::json!({
                "targetRefs": [{
                    "group": "gateway.networking.k8s.io",
                    "kind": "HTTPRoute",
                    "name": "example-route",
                }],
                "timeouts": { "request": "10s" },
                "headerModifiers": {
                    "request": {
                        "set": [{ "name": "x-env", "value": "prod" }],
                        "remove": ["x-debug"],
                    },
                },
                "rateLimit": {
                    "local": {
                        "tokenBucket": { "maxTokens": 10, "tokensPerFill": 5, "fillInterval": "1s" },
                    },
                },
            })))
            .unwrap();

        assert!(policy.is_valid(), "{:?}", policy.errors);
        assert_eq!(policy.target_refs.len(), 1);
        assert_eq!(
            ir(&policy),
            &TrafficPolicyIr {
                created: DateTime::<Utc>::MIN_UTC,
                timeout: Some(Duration::from_secs(10)),
                request_headers: Some(HeaderModifiers {
                    set: vec![("x-env".to_string(), "prod".to_string())],
                    add: vec![],
                    remove: vec!["x-debug".to_string()],
                }),
                response_headers: None,
                local_rate_limit: Some(LocalRateLimit {
                    max_tokens: 10,
                    tokens_per_fill: 5,
                    fill_interval: Duration::from_secs(1),
                }),
            }
        );
    }

    #[rstest]
    #[case(
        serde_json::json!({ "timeouts": { "request": "10 parsecs" } }),
        "invalid timeouts.request"
    )]
    #[case(
        serde_json::json!({ "timeouts": { "request": "5s-3s" } }),
        "invalid timeouts.request"
    )]
    #[case(
        serde_json::json!({ "timeouts": { "request": "99999999999999999999h" } }),
        "invalid timeouts.request"
    )]
    #[case(
        serde_json::json!({ "headerModifiers": { "request": { "add": [{ "name": "bad header", "value": "v" }] } } }),
        "invalid headerModifiers.request"
    )]
    #[case(
        serde_json::json!({ "rateLimit": { "local": { "tokenBucket": { "maxTokens": 0, "fillInterval": "1s" } } } }),
        "invalid rateLimit.local.tokenBucket"
    )]
    #[case(
        serde_json::json!({ "timeouts": "soon" }),
        "invalid spec"
    )]
    fn reports_structural_errors(#[case] spec: serde_json::Value, #[case] prefix: &str) {
        let policy = TrafficPolicyPlugin::new(true)
            .build_policy(&raw(spec))
            .unwrap();
        assert!(!policy.is_valid());
        assert!(
            policy.errors[0].message().starts_with(prefix),
            "{}",
            policy.errors[0]
        );
    }

    #[test]
    fn merge_is_fieldwise() {
        let created = |secs| DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
        let low: SharedPolicyIr = Arc::new(TrafficPolicyIr {
            created: created(20),
            timeout: Some(Duration::from_secs(1)),
            request_headers: Some(HeaderModifiers {
                remove: vec!["x-a".to_string()],
                ..Default::default()
            }),
            ..Default::default()
        });
        let shadowed: SharedPolicyIr = Arc::new(TrafficPolicyIr {
            created: created(15),
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        });
        let high: SharedPolicyIr = Arc::new(TrafficPolicyIr {
            created: created(10),
            timeout: Some(Duration::from_secs(3)),
            ..Default::default()
        });

        let merged = TrafficPolicyPlugin::new(true)
            .merge_policies(&[low, shadowed, high])
            .unwrap();
        assert_eq!(merged.contributed, vec![true, false, true]);
        let ir = merged
            .policy
            .as_any()
            .downcast_ref::<TrafficPolicyIr>()
            .unwrap();
        assert_eq!(ir.created, created(10));
        assert_eq!(ir.timeout, Some(Duration::from_secs(3)));
        assert_eq!(
            ir.request_headers.as_ref().map(|h| h.remove.clone()),
            Some(vec!["x-a".to_string()])
        );
    }

    #[test]
    fn merging_can_be_disabled() {
        assert!(TrafficPolicyPlugin::new(true).merges());
        assert!(!TrafficPolicyPlugin::new(false).merges());
        assert!(TrafficPolicyPlugin::new(false).inherits());
    }

    #[test]
    fn rate_limit_filter_only_on_used_chains() {
        let mut pass = TrafficPolicyPass::default();
        pass.rate_limited.insert("http".to_string());
        let chain = |name: &str| FilterChainCommon {
            name: name.to_string(),
            listener: name.to_string(),
            port: 8080,
        };

        let filters = pass.http_filters(&chain("http")).unwrap();
        assert_eq!(filters.len(), 1);
        assert!(filters[0].filter.disabled);
        assert_eq!(filters[0].filter.name, LOCAL_RATELIMIT_FILTER_NAME);
        assert_eq!(pass.http_filters(&chain("other")).unwrap(), vec![]);
    }
}
