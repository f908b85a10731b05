#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod registry;
mod resolve;


pub use self::{
    registry::{DuplicateKind, PolicyRegistry},
    resolve::{AttachedPolicies, GatewayPolicies, Resolver, RouteBackendId, RuleId},
};
