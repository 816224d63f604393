//! Authentication and authorization.

pub mod permissions;
pub mod provider;
pub mod rate_limit;

pub use permissions::{KeyPermissions, Permission};
pub use provider::{
    hash_password, CredentialProvider, DeviceIdentity, DeviceStatus, StaticCredentialProvider,
    UserCredentials, UserIdentity,
};
pub use rate_limit::{GatewayRateLimits, RateLimiter};
