//! Connection hub, per-connection sessions and their I/O pumps.

pub mod hub;
pub mod pump;
pub mod session;

pub use hub::{Hub, HubStatus};
pub use pump::run_session;
pub use session::{EnqueueOutcome, Session};
