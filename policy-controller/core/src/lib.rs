#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod filter_config;
pub mod ir;
pub mod pass;
pub mod plugin;
mod policy;
pub mod proxy;
pub mod raw;

pub use self::{
    filter_config::TypedFilterConfigMap,
    plugin::{MergedPolicy, Plugin},
    policy::{
        ir_equals, AttachmentReason, InheritedPolicyPriority, NotAttachable, ObjectSource,
        ObjectVersion, PolicyError, PolicyIr, PolicyKey, PolicyKind, PolicyKindInfo, PolicyRef,
        PolicyWrapper, SharedPolicyIr,
    },
};

pub const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
pub const POLICY_API_GROUP: &str = "policy.gateway.dev";
pub const DEFAULT_CONTROLLER_NAME: &str = "policy.gateway.dev/gateway-controller";
