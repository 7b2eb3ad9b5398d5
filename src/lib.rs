mod collections;
pub mod admission;
pub mod batch;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod network;
pub mod resilience;
pub mod services;
pub mod shape;
pub mod types;
pub mod world;

pub use config::Config;
pub use dispatch::{Dispatcher, Registry};
pub use network::Network;
pub use services::Services;
pub use world::{Level, World};

mod prelude {
    pub(crate) use crate::collections::*;
    pub(crate) use crate::metrics::Metrics;
    pub(crate) use crate::types::*;
    pub(crate) use std::io;
    pub(crate) use std::net::TcpStream;
    pub(crate) use std::sync::Arc;
    pub(crate) use thiserror::Error;
}
