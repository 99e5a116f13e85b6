//! Application configuration for KnowledgeForge.
//!
//! User config lives at `~/.knowledgeforge/knowledgeforge.toml`.
//! Every section is optional; missing keys fall back to defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KnowledgeForgeError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "knowledgeforge.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".knowledgeforge";

// ---------------------------------------------------------------------------
// Config structs (matching knowledgeforge.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Reasoning service endpoint and call policy.
    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub extractor: ExtractorSection,

    #[serde(default)]
    pub write_queue: WriteQueueSection,

    #[serde(default)]
    pub scenarios: ScenariosSection,

    /// Quality gate and cycle ceiling.
    #[serde(default)]
    pub orchestrator: OrchestratorSection,

    #[serde(default)]
    pub promotion: PromotionSection,
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_filter() -> String {
    "knowledgeforge=info".into()
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.knowledgeforge/knowledge.db".into()
}

impl StorageConfig {
    /// `db_path` with a leading `~/` expanded to the home directory.
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        expand_home(&self.db_path)
    }
}

/// `[reasoning]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    /// Full URL of the proposal endpoint.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-call timeout.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts per unit, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay between attempts; doubles after each retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8088/v1/propose".into()
}
fn default_model() -> String {
    "default".into()
}
fn default_api_key_env() -> String {
    "KNOWLEDGEFORGE_REASONING_KEY".into()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    250
}

/// `[extractor]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractorSection {
    /// Sources above this size are rejected before segmentation.
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Concurrent reasoning calls per source.
    #[serde(default = "default_unit_concurrency")]
    pub unit_concurrency: usize,

    /// Proposals below this confidence are discarded.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,

    /// Soft time target per source; exceeding it only logs a warning.
    #[serde(default = "default_target_secs")]
    pub target_secs: u64,
}

impl Default for ExtractorSection {
    fn default() -> Self {
        Self {
            max_source_bytes: default_max_source_bytes(),
            unit_concurrency: default_unit_concurrency(),
            min_confidence: default_min_confidence(),
            target_secs: default_target_secs(),
        }
    }
}

fn default_max_source_bytes() -> usize {
    256 * 1024
}
fn default_unit_concurrency() -> usize {
    4
}
fn default_min_confidence() -> f64 {
    0.5
}
fn default_target_secs() -> u64 {
    60
}

/// `[write_queue]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQueueSection {
    /// Schema rejections of the same package before it is dead-lettered.
    #[serde(default = "default_max_schema_failures")]
    pub max_schema_failures: u32,

    /// Re-extractions allowed per source after commit conflicts.
    #[serde(default = "default_conflict_retry_budget")]
    pub conflict_retry_budget: u32,
}

impl Default for WriteQueueSection {
    fn default() -> Self {
        Self {
            max_schema_failures: default_max_schema_failures(),
            conflict_retry_budget: default_conflict_retry_budget(),
        }
    }
}

fn default_max_schema_failures() -> u32 {
    3
}
fn default_conflict_retry_budget() -> u32 {
    3
}

/// `[scenarios]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenariosSection {
    #[serde(default = "default_initial_batch")]
    pub initial_batch: usize,

    /// Hard ceiling on suite size.
    #[serde(default = "default_max_scenarios")]
    pub max_scenarios: usize,

    /// Negative-boundary scenarios emitted per predicate.
    #[serde(default = "default_negatives_per_predicate")]
    pub negatives_per_predicate: usize,
}

impl Default for ScenariosSection {
    fn default() -> Self {
        Self {
            initial_batch: default_initial_batch(),
            max_scenarios: default_max_scenarios(),
            negatives_per_predicate: default_negatives_per_predicate(),
        }
    }
}

fn default_initial_batch() -> usize {
    16
}
fn default_max_scenarios() -> usize {
    64
}
fn default_negatives_per_predicate() -> usize {
    1
}

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,

    #[serde(default = "default_pass_rate_gate")]
    pub pass_rate_gate: f64,

    #[serde(default = "default_completeness_gate")]
    pub completeness_gate: f64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            pass_rate_gate: default_pass_rate_gate(),
            completeness_gate: default_completeness_gate(),
        }
    }
}

fn default_max_cycles() -> u32 {
    5
}
fn default_pass_rate_gate() -> f64 {
    0.95
}
fn default_completeness_gate() -> f64 {
    0.90
}

/// `[promotion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionSection {
    /// Parity below this rolls the candidate back.
    #[serde(default = "default_parity_threshold")]
    pub parity_threshold: f64,

    /// Minimum time a stage must run before advancing.
    #[serde(default = "default_observation_window_secs")]
    pub observation_window_secs: u64,

    /// Evaluations a stage must see before advancing.
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,

    /// Recorded on every decision.
    #[serde(default = "default_evaluator_id")]
    pub evaluator_id: String,
}

impl Default for PromotionSection {
    fn default() -> Self {
        Self {
            parity_threshold: default_parity_threshold(),
            observation_window_secs: default_observation_window_secs(),
            min_observations: default_min_observations(),
            evaluator_id: default_evaluator_id(),
        }
    }
}

fn default_parity_threshold() -> f64 {
    0.90
}
fn default_observation_window_secs() -> u64 {
    3600
}
fn default_min_observations() -> usize {
    1
}
fn default_evaluator_id() -> String {
    "reference-match".into()
}

// ---------------------------------------------------------------------------
// Runtime configs (derived from AppConfig)
// ---------------------------------------------------------------------------

/// Timeout and retry policy for reasoning calls.
#[derive(Debug, Clone, PartialEq)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for CallPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.reasoning.timeout_ms),
            max_attempts: config.reasoning.max_attempts.max(1),
            backoff: Duration::from_millis(config.reasoning.retry_backoff_ms),
        }
    }
}

/// Runtime extractor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorConfig {
    pub max_source_bytes: usize,
    pub unit_concurrency: usize,
    pub min_confidence: f64,
    pub target: Duration,
    pub call_policy: CallPolicy,
    /// Stamped on every triple's provenance.
    pub extractor_version: String,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExtractorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_source_bytes: config.extractor.max_source_bytes,
            unit_concurrency: config.extractor.unit_concurrency.max(1),
            min_confidence: config.extractor.min_confidence,
            target: Duration::from_secs(config.extractor.target_secs),
            call_policy: CallPolicy::from(config),
            extractor_version: format!(
                "knowledgeforge-extractor/{}+{}",
                env!("CARGO_PKG_VERSION"),
                config.reasoning.model
            ),
        }
    }
}

/// Runtime write-queue configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub max_schema_failures: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for QueueConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_schema_failures: config.write_queue.max_schema_failures.max(1),
        }
    }
}

/// Runtime scenario-generation configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioConfig {
    pub initial_batch: usize,
    pub max_scenarios: usize,
    pub negatives_per_predicate: usize,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ScenarioConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            initial_batch: config.scenarios.initial_batch,
            max_scenarios: config.scenarios.max_scenarios.max(1),
            negatives_per_predicate: config.scenarios.negatives_per_predicate,
        }
    }
}

/// Runtime orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_cycles: u32,
    pub pass_rate_gate: f64,
    pub completeness_gate: f64,
    pub conflict_retry_budget: u32,
    pub max_source_bytes: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for OrchestratorConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_cycles: config.orchestrator.max_cycles.max(1),
            pass_rate_gate: config.orchestrator.pass_rate_gate,
            completeness_gate: config.orchestrator.completeness_gate,
            conflict_retry_budget: config.write_queue.conflict_retry_budget,
            max_source_bytes: config.extractor.max_source_bytes,
        }
    }
}

impl OrchestratorConfig {
    /// Both thresholds must hold.
    pub fn gate_met(&self, pass_rate: f64, completeness: f64) -> bool {
        pass_rate >= self.pass_rate_gate && completeness >= self.completeness_gate
    }
}

/// Runtime promotion configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutPolicy {
    pub parity_threshold: f64,
    pub observation_window: chrono::Duration,
    pub min_observations: usize,
    pub evaluator_id: String,
}

impl Default for RolloutPolicy {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for RolloutPolicy {
    fn from(config: &AppConfig) -> Self {
        let secs = i64::try_from(config.promotion.observation_window_secs).unwrap_or(i64::MAX);
        Self {
            parity_threshold: config.promotion.parity_threshold,
            observation_window: chrono::Duration::try_seconds(secs)
                .unwrap_or_else(|| chrono::Duration::days(365 * 100)),
            min_observations: config.promotion.min_observations.max(1),
            evaluator_id: config.promotion.evaluator_id.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.knowledgeforge/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| KnowledgeForgeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.knowledgeforge/knowledgeforge.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| KnowledgeForgeError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        KnowledgeForgeError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| KnowledgeForgeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| KnowledgeForgeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| KnowledgeForgeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Reject values that would make the pipeline misbehave.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    let unit = |name: &str, v: f64| {
        if (0.0..=1.0).contains(&v) {
            Ok(())
        } else {
            Err(KnowledgeForgeError::config(format!(
                "{name} must be within [0, 1], got {v}"
            )))
        }
    };
    unit("extractor.min_confidence", config.extractor.min_confidence)?;
    unit("orchestrator.pass_rate_gate", config.orchestrator.pass_rate_gate)?;
    unit("orchestrator.completeness_gate", config.orchestrator.completeness_gate)?;
    unit("promotion.parity_threshold", config.promotion.parity_threshold)?;

    url::Url::parse(&config.reasoning.endpoint).map_err(|e| {
        KnowledgeForgeError::config(format!(
            "reasoning.endpoint {:?} is not a valid URL: {e}",
            config.reasoning.endpoint
        ))
    })?;

    if config.scenarios.initial_batch > config.scenarios.max_scenarios {
        return Err(KnowledgeForgeError::config(
            "scenarios.initial_batch cannot exceed scenarios.max_scenarios",
        ));
    }
    Ok(())
}

/// Read the reasoning API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.reasoning.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(KnowledgeForgeError::config(format!(
            "reasoning API key not found. Set the {var_name} environment variable."
        ))),
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| KnowledgeForgeError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}
