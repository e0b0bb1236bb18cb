//! Shared types, error model, configuration and path validation for vault-intel.
//!
//! This crate is the foundation depended on by all other vault-intel crates.
//! It provides:
//! - [`VaultIntelError`], the unified error type
//! - Domain types ([`AgentResult`], [`Issue`], [`AgentKind`], report payloads)
//! - Configuration ([`AppConfig`] and its sections, config loading)
//! - [`PathValidator`] and the [`ResolvedPaths`] it produces

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BriefingConfig, CrossReferenceConfig, HoldingsConfig, HygieneConfig,
    NotifyConfig, PathsConfig, PositionRiskConfig, SafetyConfig, config_dir, config_file_path,
    init_config, load_config, load_config_from,
};
pub use error::{Result, VaultIntelError};
pub use paths::{PathValidator, ResolvedPaths};
pub use types::{
    Action, ActionKind, AgentKind, AgentReport, AgentResult, BriefingSummary, Direction,
    ErrorKind, HoldingsDelta, Issue, IssueKind, NarrativeShift, PositionEntry, RecoveredError,
    ResultSet, Severity, SizeChange, Stance, Status,
};
