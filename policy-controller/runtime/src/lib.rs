#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use gateway_policy_controller_core as core;
pub use gateway_policy_controller_index as index;
pub use gateway_policy_controller_k8s_api as k8s;
pub use gateway_policy_controller_k8s_status as status;
pub use gateway_policy_controller_translate as translate;

mod args;
pub mod driver;
mod metrics;
pub mod snapshot;
pub mod validator;

pub use self::{
    args::Args,
    driver::{Driver, Outputs},
    metrics::DriverMetrics,
    snapshot::{FileSnapshotSource, Snapshot},
    validator::{BinaryValidator, DockerValidator, ValidationError, Validator},
};
