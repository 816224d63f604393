//! hatch-gateway: accepts reverse tunnels from device agents and routes
//! client sessions to them, across any number of gateway instances.

pub mod auth;
pub mod broker;
pub mod config;
pub mod handshake;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod status;
pub mod tls;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod testkit;

pub use broker::{BrokerOutcome, BrokerState, SessionBroker};
pub use config::GatewayConfig;
pub use server::{Gateway, GatewayParts};
