//! Application configuration for vault-intel.
//!
//! User config lives at `~/.vault-intel/vault-intel.toml`.
//! `--config` on the CLI overrides the location; every field except the
//! root paths has a default so a minimal file only needs `[paths]`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultIntelError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "vault-intel.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".vault-intel";

// ---------------------------------------------------------------------------
// Config structs (matching vault-intel.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Root directories.
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub hygiene: HygieneConfig,

    #[serde(default)]
    pub cross_reference: CrossReferenceConfig,

    #[serde(default)]
    pub position_risk: PositionRiskConfig,

    #[serde(default)]
    pub holdings: HoldingsConfig,

    #[serde(default)]
    pub briefing: BriefingConfig,

    /// Locking, write retries, worker pool and rename limits.
    #[serde(default)]
    pub safety: SafetyConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// `[paths]` section. Every entry is checked by the path validator at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root of the note tree.
    #[serde(default = "default_vault")]
    pub vault: String,

    /// Portfolio store (positions JSON + per-company thesis records).
    #[serde(default = "default_portfolio")]
    pub portfolio: String,

    /// Holdings snapshot root; CSVs live under `<holdings>/output/`.
    #[serde(default = "default_holdings")]
    pub holdings: String,

    /// Ticker → {name, aliases} YAML dictionary. Optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_dictionary: Option<String>,

    /// Run records, latest mirror, lock file and index export.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            vault: default_vault(),
            portfolio: default_portfolio(),
            holdings: default_holdings(),
            entity_dictionary: None,
            data_dir: default_data_dir(),
        }
    }
}

fn default_vault() -> String {
    "~/Vault".into()
}
fn default_portfolio() -> String {
    "~/portfolio".into()
}
fn default_holdings() -> String {
    "~/13f".into()
}
fn default_data_dir() -> String {
    "~/.vault-intel/data".into()
}

/// `[hygiene]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HygieneConfig {
    /// Top-level vault folders to lint.
    #[serde(default = "default_scan_folders")]
    pub scan_folders: Vec<String>,

    /// Directory names skipped everywhere (also by the reference indexer).
    #[serde(default = "default_ignore_folders")]
    pub ignore_folders: Vec<String>,

    /// Body bytes (frontmatter excluded, trimmed) below which a note is "empty".
    #[serde(default = "default_min_content_bytes")]
    pub min_content_bytes: usize,

    #[serde(default = "default_true")]
    pub auto_fix_frontmatter: bool,

    /// Renaming breaks references elsewhere in the vault, so this is off by default.
    #[serde(default)]
    pub auto_fix_date_prefix: bool,

    /// Folder whose notes are checked for misplacement.
    #[serde(default = "default_inbox_folder")]
    pub inbox_folder: String,

    /// Where misplaced research notes are suggested to go.
    #[serde(default = "default_research_destination")]
    pub research_destination: String,

    /// Top-level folder → tag used when synthesizing frontmatter.
    #[serde(default = "default_folder_tags")]
    pub folder_tags: BTreeMap<String, String>,
}

impl Default for HygieneConfig {
    fn default() -> Self {
        Self {
            scan_folders: default_scan_folders(),
            ignore_folders: default_ignore_folders(),
            min_content_bytes: default_min_content_bytes(),
            auto_fix_frontmatter: true,
            auto_fix_date_prefix: false,
            inbox_folder: default_inbox_folder(),
            research_destination: default_research_destination(),
            folder_tags: default_folder_tags(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_scan_folders() -> Vec<String> {
    ["Inbox", "Research", "Sources", "Meetings", "Writing"]
        .map(String::from)
        .to_vec()
}
fn default_ignore_folders() -> Vec<String> {
    [".obsidian", ".trash", "Archive"].map(String::from).to_vec()
}
fn default_min_content_bytes() -> usize {
    50
}
fn default_inbox_folder() -> String {
    "Inbox".into()
}
fn default_research_destination() -> String {
    "Research/Notes".into()
}
fn default_folder_tags() -> BTreeMap<String, String> {
    [
        ("Inbox", "inbox"),
        ("Research", "research"),
        ("Sources", "source"),
        ("Meetings", "meeting"),
        ("Writing", "writing"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// `[cross_reference]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrossReferenceConfig {
    /// Vault-relative folders holding research notes.
    #[serde(default = "default_research_folders")]
    pub research_folders: Vec<String>,

    /// Only notes modified within this many days are considered.
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,

    /// Short tickers that collide with ordinary words.
    #[serde(default = "default_ticker_blocklist")]
    pub ticker_blocklist: Vec<String>,

    /// Vault-relative folder containing `<TICKER> MOC.md` topic indexes.
    #[serde(default = "default_moc_folder")]
    pub moc_folder: String,

    /// Folder whose notes feed narrative-drift detection.
    #[serde(default = "default_analysis_folder")]
    pub analysis_folder: String,

    /// Distinct polarity hits needed before a shift is reported.
    #[serde(default = "default_narrative_min_signals")]
    pub narrative_min_signals: usize,
}

impl Default for CrossReferenceConfig {
    fn default() -> Self {
        Self {
            research_folders: default_research_folders(),
            lookback_days: default_lookback_days(),
            ticker_blocklist: default_ticker_blocklist(),
            moc_folder: default_moc_folder(),
            analysis_folder: default_analysis_folder(),
            narrative_min_signals: default_narrative_min_signals(),
        }
    }
}

fn default_research_folders() -> Vec<String> {
    ["Research/Earnings", "Research/Notes", "Inbox"]
        .map(String::from)
        .to_vec()
}
fn default_lookback_days() -> u32 {
    7
}
fn default_ticker_blocklist() -> Vec<String> {
    [
        "A", "AI", "ALL", "AN", "ARE", "AT", "BE", "CEO", "CFO", "DD", "EPS", "ETF", "FOR",
        "GDP", "IT", "NOW", "ON", "ONE", "OR", "SO", "TV", "UK", "US", "YOY",
    ]
    .map(String::from)
    .to_vec()
}
fn default_moc_folder() -> String {
    "Navigation/MOC".into()
}
fn default_analysis_folder() -> String {
    "Research/Earnings".into()
}
fn default_narrative_min_signals() -> usize {
    3
}

/// `[position_risk]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRiskConfig {
    /// Hours a kill-criteria FAIL may stay unresolved before it is critical.
    #[serde(default = "default_violation_hours")]
    pub violation_hours: i64,

    /// Unrealized P&L percentage below which a drawdown alert fires.
    #[serde(default = "default_pnl_alert_pct")]
    pub pnl_alert_pct: f64,

    /// Share of NAV above which a concentration alert fires.
    #[serde(default = "default_position_alert_pct")]
    pub position_alert_pct: f64,

    /// Days without a thesis edit before it is considered stale.
    #[serde(default = "default_stale_check_days")]
    pub stale_check_days: i64,
}

impl Default for PositionRiskConfig {
    fn default() -> Self {
        Self {
            violation_hours: default_violation_hours(),
            pnl_alert_pct: default_pnl_alert_pct(),
            position_alert_pct: default_position_alert_pct(),
            stale_check_days: default_stale_check_days(),
        }
    }
}

fn default_violation_hours() -> i64 {
    48
}
fn default_pnl_alert_pct() -> f64 {
    -10.0
}
fn default_position_alert_pct() -> f64 {
    5.0
}
fn default_stale_check_days() -> i64 {
    14
}

/// `[holdings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldingsConfig {
    /// Snapshot file prefix; the period label follows it (`_ALL_HOLDINGS_2025Q3.csv`).
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    /// Manager CIKs to keep. Empty keeps everyone.
    #[serde(default)]
    pub tracked_managers: Vec<String>,

    /// Minimum |Δshares| / prior shares, in percent.
    #[serde(default = "default_min_position_change_pct")]
    pub min_position_change_pct: f64,

    /// Value floor in $K for new positions, exits and size changes.
    #[serde(default = "default_min_value")]
    pub min_value: f64,

    /// Cap on each reported list.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for HoldingsConfig {
    fn default() -> Self {
        Self {
            snapshot_prefix: default_snapshot_prefix(),
            tracked_managers: Vec::new(),
            min_position_change_pct: default_min_position_change_pct(),
            min_value: default_min_value(),
            max_entries: default_max_entries(),
        }
    }
}

fn default_snapshot_prefix() -> String {
    "_ALL_HOLDINGS_".into()
}
fn default_min_position_change_pct() -> f64 {
    20.0
}
fn default_min_value() -> f64 {
    10_000.0
}
fn default_max_entries() -> usize {
    50
}

/// `[briefing]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BriefingConfig {
    /// Vault-relative folder receiving `<date>-briefing.md`.
    #[serde(default = "default_output_folder")]
    pub output_folder: String,

    #[serde(default = "default_max_action_items")]
    pub max_action_items: usize,
}

impl Default for BriefingConfig {
    fn default() -> Self {
        Self {
            output_folder: default_output_folder(),
            max_action_items: default_max_action_items(),
        }
    }
}

fn default_output_folder() -> String {
    "Navigation/Nightly-Intel".into()
}
fn default_max_action_items() -> usize {
    10
}

/// `[safety]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_true")]
    pub lock_enabled: bool,

    /// A lock older than this is treated as abandoned.
    #[serde(default = "default_lock_timeout_hours")]
    pub lock_timeout_hours: u64,

    /// Upper bound on date-prefix renames in one run.
    #[serde(default)]
    pub max_renames_per_run: usize,

    /// Per-agent wall-clock budget for Stage 2.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Stage 2 worker pool size.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Attempts for each atomic write before giving up.
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,

    /// Base backoff between write attempts; grows linearly.
    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            lock_enabled: true,
            lock_timeout_hours: default_lock_timeout_hours(),
            max_renames_per_run: 0,
            agent_timeout_secs: default_agent_timeout_secs(),
            max_workers: default_max_workers(),
            write_retries: default_write_retries(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
        }
    }
}

fn default_lock_timeout_hours() -> u64 {
    2
}
fn default_agent_timeout_secs() -> u64 {
    300
}
fn default_max_workers() -> usize {
    3
}
fn default_write_retries() -> u32 {
    3
}
fn default_write_retry_backoff_ms() -> u64 {
    500
}

/// `[notify]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Name of the env var holding the bot token (never store the token itself).
    #[serde(default = "default_bot_token_env")]
    pub bot_token_env: String,

    /// Name of the env var holding the destination chat id.
    #[serde(default = "default_chat_id_env")]
    pub chat_id_env: String,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bot_token_env: default_bot_token_env(),
            chat_id_env: default_chat_id_env(),
            api_base: default_api_base(),
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

fn default_bot_token_env() -> String {
    "TELEGRAM_BOT_TOKEN".into()
}
fn default_chat_id_env() -> String {
    "TELEGRAM_ALLOWED_CHAT_ID".into()
}
fn default_api_base() -> String {
    "https://api.telegram.org".into()
}
fn default_notify_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.vault-intel/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| VaultIntelError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.vault-intel/vault-intel.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from the default location.
///
/// Unlike most tools, a missing file is an error: the default root paths are
/// placeholders and running the pipeline against them would be meaningless.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        return Err(VaultIntelError::config(format!(
            "config file not found at {}. Run `vault-intel config init` first.",
            path.display()
        )));
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| VaultIntelError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        VaultIntelError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file. An existing file is left alone.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| VaultIntelError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    if path.exists() {
        tracing::info!(?path, "config file already exists, leaving it untouched");
        return Ok(path);
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| VaultIntelError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| VaultIntelError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("scan_folders"));
        assert!(toml_str.contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let toml_str = r#"
[paths]
vault = "/home/op/Vault"
portfolio = "/home/op/portfolio"
holdings = "/home/op/13f"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.paths.vault, "/home/op/Vault");
        assert_eq!(config.paths.data_dir, "~/.vault-intel/data");
        assert_eq!(config.hygiene.min_content_bytes, 50);
        assert!(!config.hygiene.auto_fix_date_prefix);
        assert_eq!(config.holdings.min_position_change_pct, 20.0);
        assert_eq!(config.safety.max_workers, 3);
        assert_eq!(config.safety.max_renames_per_run, 0);
        assert_eq!(config.hygiene.folder_tags.get("Meetings").map(String::as_str), Some("meeting"));
    }

    #[test]
    fn section_overrides() {
        let toml_str = r#"
[holdings]
tracked_managers = ["0001067983"]
min_value = 5000.0

[safety]
lock_enabled = false
agent_timeout_secs = 30
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.holdings.tracked_managers, vec!["0001067983"]);
        assert_eq!(config.holdings.min_value, 5000.0);
        assert_eq!(config.holdings.max_entries, 50);
        assert!(!config.safety.lock_enabled);
        assert_eq!(config.safety.agent_timeout_secs, 30);
    }

    #[test]
    fn load_from_missing_file_is_io_error() {
        let path = std::env::temp_dir().join(format!(
            "vi-config-missing-{}.toml",
            uuid::Uuid::now_v7()
        ));
        let err = load_config_from(&path).unwrap_err();
        assert!(matches!(err, VaultIntelError::Io { .. }));
    }

    #[test]
    fn load_from_invalid_toml_is_config_error() {
        let path = std::env::temp_dir().join(format!(
            "vi-config-bad-{}.toml",
            uuid::Uuid::now_v7()
        ));
        std::fs::write(&path, "[paths\nvault = 1").unwrap();
        let err = load_config_from(&path).unwrap_err();
        assert!(err.is_fatal());
        let _ = std::fs::remove_file(&path);
    }
}
