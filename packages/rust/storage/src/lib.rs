//! Flat-file persistence for vault-intel.
//!
//! - [`RunStore`] keeps every agent result per run (`runs/<run_id>/`) and
//!   mirrors the newest copy into `latest/`, which is how standalone agents
//!   and the briefing find their inputs.
//! - [`LockManager`] guards against two pipeline runs overlapping on one host.

mod lock;
mod runs;

pub use lock::{LockGuard, LockManager, LockRecord};
pub use runs::RunStore;
