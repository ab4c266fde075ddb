//! Inbound frame routing.

pub mod pending;
pub mod router;

pub use pending::PendingRequests;
pub use router::{MessageRouter, RouteError};
