//! Vault access for vault-intel: note parsing, markdown discovery, the
//! reference index, and atomic writes.

pub mod fsutil;
pub mod index;
pub mod note;
pub mod walk;

pub use fsutil::{RetryPolicy, rename_no_clobber, write_atomic, write_atomic_with};
pub use index::ReferenceIndex;
