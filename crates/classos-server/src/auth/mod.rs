//! Upgrade-request authorization.

pub mod directory;
pub mod error;
pub mod gate;

pub use directory::{DeviceDirectory, OpenDirectory, StaticDirectory};
pub use error::AuthError;
pub use gate::{AuthGate, DEVICE_TOKEN_PREFIX, Identity, credential_from_request};
