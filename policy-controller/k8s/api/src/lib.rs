#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod status;

pub use self::{
    duration::PolicyDuration,
    status::{Condition, ParentReference, PolicyAncestorStatus, PolicyStatus},
};
