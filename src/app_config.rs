use anyhow::{anyhow, Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for the number of concurrent batches per book
pub const MAX_WORKER_COUNT: usize = 1024;

/// Upper bound for every configured duration: one week, in seconds
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Application configuration module
/// This module handles the application configuration including loading,
/// validating and saving configuration settings.
/// Represents the application configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// SQLite store holding the sentence relation
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Generative backend settings
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Batching, concurrency, retry and deadline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Where call credentials come from
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Optional auxiliary context source
    #[serde(default)]
    pub context: ContextConfig,

    /// Drop reports and debug output
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Generative backend configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    // @field: Service URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    // @field: Model name
    #[serde(default = "default_model")]
    pub model: String,

    // @field: File holding the system instruction sent with every call
    #[serde(default)]
    pub system_prompt_path: Option<PathBuf>,

    // @field: Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    // @field: Nucleus sampling
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    // @field: Top-k sampling
    #[serde(default = "default_top_k")]
    pub top_k: u32,

    // @field: Reasoning token budget, None to leave it to the backend
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: Option<u32>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model: default_model(),
            system_prompt_path: None,
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            thinking_budget: default_thinking_budget(),
        }
    }
}

impl ProviderConfig {
    /// Read the system instruction file, if one is configured
    pub fn load_system_prompt(&self) -> Result<Option<String>> {
        match &self.system_prompt_path {
            Some(path) => {
                let prompt = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read system prompt file: {:?}", path))?;
                Ok(Some(prompt))
            }
            None => Ok(None),
        }
    }
}

/// Batching, concurrency and retry settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Worker pool size per book
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Upper bound on the cumulative source characters of a batch
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Timeout of the first call attempt
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Timeout of every retry attempt
    #[serde(default = "default_retry_call_timeout_secs")]
    pub retry_call_timeout_secs: u64,

    /// Retries per batch after the first attempt
    #[serde(default)]
    pub max_retries: u32,

    /// Overall budget for one book
    #[serde(default = "default_book_deadline_secs")]
    pub book_deadline_secs: u64,

    /// Pause before retrying after an ordinary failure
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Pause before retrying after a timeout
    #[serde(default = "default_timeout_retry_delay_ms")]
    pub timeout_retry_delay_ms: u64,

    /// How long a worker waits to enqueue a write request
    #[serde(default = "default_write_submit_timeout_secs")]
    pub write_submit_timeout_secs: u64,

    /// How long a worker waits for the writer to acknowledge
    #[serde(default = "default_write_ack_timeout_secs")]
    pub write_ack_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_chunk_chars: default_max_chunk_chars(),
            call_timeout_secs: default_call_timeout_secs(),
            retry_call_timeout_secs: default_retry_call_timeout_secs(),
            max_retries: 0,
            book_deadline_secs: default_book_deadline_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_retry_delay_ms: default_timeout_retry_delay_ms(),
            write_submit_timeout_secs: default_write_submit_timeout_secs(),
            write_ack_timeout_secs: default_write_ack_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    /// Call timeout for the given zero-based attempt number
    pub fn call_timeout(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::from_secs(self.call_timeout_secs)
        } else {
            Duration::from_secs(self.retry_call_timeout_secs)
        }
    }

    pub fn book_deadline(&self) -> Duration {
        Duration::from_secs(self.book_deadline_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn timeout_retry_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_retry_delay_ms)
    }

    pub fn write_submit_timeout(&self) -> Duration {
        Duration::from_secs(self.write_submit_timeout_secs)
    }

    pub fn write_ack_timeout(&self) -> Duration {
        Duration::from_secs(self.write_ack_timeout_secs)
    }

    /// Total attempts per batch, including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Values taken from the environment or the command line that win over the file
#[derive(Debug, Clone, Default)]
pub struct PipelineOverrides {
    pub worker_count: Option<usize>,
    pub max_chunk_chars: Option<usize>,
    pub call_timeout_secs: Option<u64>,
    pub retry_call_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub book_deadline_secs: Option<u64>,
}

/// Call credential source
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Environment variable holding newline-separated keys
    #[serde(default = "default_credentials_env_var")]
    pub env_var: String,

    /// File holding one key per line; used in addition to the variable
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_var: default_credentials_env_var(),
            file: None,
        }
    }
}

/// Auxiliary context configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ContextConfig {
    /// SQLite file with a `paragraph_context` table
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Diagnostics output configuration
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct DiagnosticsConfig {
    /// JSON-lines file receiving one record per dropped batch
    #[serde(default)]
    pub drop_report_path: Option<PathBuf>,

    /// Audit log of every translation the writer applies
    #[serde(default)]
    pub translation_log_path: Option<PathBuf>,

    /// Directory receiving first-attempt response previews per book
    #[serde(default)]
    pub response_debug_dir: Option<PathBuf>,
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("translations.db")
}

fn default_endpoint() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_temperature() -> f32 {
    0.5
}

fn default_top_p() -> f32 {
    0.95
}

fn default_top_k() -> u32 {
    30
}

fn default_thinking_budget() -> Option<u32> {
    Some(1024)
}

fn default_worker_count() -> usize {
    6
}

fn default_max_chunk_chars() -> usize {
    1500
}

fn default_call_timeout_secs() -> u64 {
    180
}

fn default_retry_call_timeout_secs() -> u64 {
    120
}

fn default_book_deadline_secs() -> u64 {
    1800 // 30 minutes per book
}

fn default_retry_delay_ms() -> u64 {
    5000
}

fn default_timeout_retry_delay_ms() -> u64 {
    10000 // wait longer after a timeout
}

fn default_write_submit_timeout_secs() -> u64 {
    15
}

fn default_write_ack_timeout_secs() -> u64 {
    30
}

fn default_credentials_env_var() -> String {
    "GEMINI_API_KEYS".to_string()
}

impl Config {
    /// Load the configuration file, writing a default one when it does not exist
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let file = File::open(config_path)
                .with_context(|| format!("Failed to open config file: {:?}", config_path))?;

            let reader = BufReader::new(file);
            let config: Config = serde_json::from_reader(reader)
                .with_context(|| format!("Failed to parse config file: {:?}", config_path))?;

            Ok(config)
        } else {
            warn!("Config file not found at {:?}, creating default config.", config_path);

            let config = Config::default();
            let config_json = serde_json::to_string_pretty(&config)
                .context("Failed to serialize default config to JSON")?;

            std::fs::write(config_path, config_json)
                .with_context(|| format!("Failed to write default config to file: {:?}", config_path))?;

            Ok(config)
        }
    }

    /// Apply environment / command line overrides on top of the file values
    pub fn apply_overrides(&mut self, overrides: &PipelineOverrides) {
        let pipeline = &mut self.pipeline;
        if let Some(v) = overrides.worker_count {
            pipeline.worker_count = v;
        }
        if let Some(v) = overrides.max_chunk_chars {
            pipeline.max_chunk_chars = v;
        }
        if let Some(v) = overrides.call_timeout_secs {
            pipeline.call_timeout_secs = v;
        }
        if let Some(v) = overrides.retry_call_timeout_secs {
            pipeline.retry_call_timeout_secs = v;
        }
        if let Some(v) = overrides.max_retries {
            pipeline.max_retries = v;
        }
        if let Some(v) = overrides.book_deadline_secs {
            pipeline.book_deadline_secs = v;
        }
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;

        if pipeline.worker_count == 0 || pipeline.worker_count > MAX_WORKER_COUNT {
            return Err(anyhow!(
                "worker_count must be between 1 and {} (got {})",
                MAX_WORKER_COUNT,
                pipeline.worker_count
            ));
        }
        if pipeline.max_chunk_chars == 0 {
            return Err(anyhow!("max_chunk_chars must be at least 1"));
        }
        if pipeline.call_timeout_secs == 0 || pipeline.retry_call_timeout_secs == 0 {
            return Err(anyhow!("Call timeouts must be greater than zero"));
        }
        if pipeline.call_timeout_secs > MAX_DURATION_SECS {
            return Err(anyhow!(
                "call_timeout_secs must not exceed {} (got {})",
                MAX_DURATION_SECS,
                pipeline.call_timeout_secs
            ));
        }
        if pipeline.retry_call_timeout_secs > pipeline.call_timeout_secs {
            return Err(anyhow!(
                "retry_call_timeout_secs ({}) must not exceed call_timeout_secs ({})",
                pipeline.retry_call_timeout_secs,
                pipeline.call_timeout_secs
            ));
        }
        if pipeline.book_deadline_secs == 0 || pipeline.book_deadline_secs > MAX_DURATION_SECS {
            return Err(anyhow!(
                "book_deadline_secs must be between 1 and {} (got {})",
                MAX_DURATION_SECS,
                pipeline.book_deadline_secs
            ));
        }
        if pipeline.write_submit_timeout_secs == 0 || pipeline.write_ack_timeout_secs == 0 {
            return Err(anyhow!("Write timeouts must be greater than zero"));
        }
        if pipeline.write_submit_timeout_secs > MAX_DURATION_SECS || pipeline.write_ack_timeout_secs > MAX_DURATION_SECS {
            return Err(anyhow!("Write timeouts must not exceed {} seconds", MAX_DURATION_SECS));
        }
        if self.provider.model.trim().is_empty() {
            return Err(anyhow!("A model name is required"));
        }

        Ok(())
    }
}

/// Default implementation for Config
impl Default for Config {
    fn default() -> Self {
        Config {
            database_path: default_database_path(),
            provider: ProviderConfig::default(),
            pipeline: PipelineConfig::default(),
            credentials: CredentialsConfig::default(),
            context: ContextConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
            log_level: LogLevel::default(),
        }
    }
}
