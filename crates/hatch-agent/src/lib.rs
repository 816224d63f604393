//! hatch-agent: the device side of a hatch tunnel.
//!
//! Dials out to a gateway, proves the device identity and serves the
//! channels the gateway opens: PTY shells, exec, TCP port-forwards and the
//! sftp subsystem.

pub mod channel;
pub mod config;
pub mod connect;
pub mod credential;
pub mod forward;
pub mod pty;

pub use channel::{serve_channel, ChannelServices};
pub use config::AgentConfig;
pub use connect::{Agent, Backoff, GatewayAck};
pub use credential::DeviceCredential;
pub use forward::ForwardPolicy;
