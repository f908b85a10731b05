#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod reporter;

#[cfg(test)]
mod tests;

pub use self::{
    index::{Controller, ControllerMetrics, Index, IndexMetrics, SharedIndex, Update},
    reporter::{gateway_ancestor, PolicyReporter, Reporter},
};
