//! Pipeline orchestration for vault-intel.
//!
//! The [`Coordinator`] owns the run lock, builds the shared reference index,
//! drives the three agent stages, persists every result and sends the
//! nightly summary.

pub mod coordinator;
pub mod progress;

pub use coordinator::{Coordinator, PipelineOutcome};
pub use progress::{ProgressReporter, SilentProgress};
