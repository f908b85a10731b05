#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod pipeline;
pub mod plugins;
mod snapshot;


pub use self::{
    pipeline::GatewayTranslator,
    snapshot::{Diagnostic, ProxySnapshot},
};
