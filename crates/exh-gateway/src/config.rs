//! Server configuration.
//!
//! Loaded from TOML: `--config <path>`, else `<config_dir>/exhaust/config.toml`
//! when present, else built-in defaults. Unknown keys are rejected so typos
//! surface at startup instead of silently falling back to defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use exh_analyzer::{AnalyzerConfig, RuleSet, RuleSpec};
use exh_broker::BrokerConfig;
use exh_protocol::{
    ExhaustError, DEFAULT_BACKLOG, DEFAULT_MAX_LINE_BYTES, DEFAULT_PARTIAL_LINE_TIMEOUT_SECS,
    DEFAULT_SUBSCRIBER_BUFFER, DEFAULT_WINDOW_RECORDS, DEFAULT_WINDOW_SECS,
};

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:9380";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExhaustConfig {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub broker: BrokerSection,
    pub analyzer: AnalyzerSection,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Base of the `stream_url` handed to uploaders. Defaults to
    /// `http://<bind_addr>`.
    pub public_base_url: Option<String>,
    /// When set, management routes require `Authorization: Bearer <admin_token>`.
    pub admin_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            public_base_url: None,
            admin_token: None,
        }
    }
}

impl ServerConfig {
    pub fn public_base_url(&self) -> String {
        match &self.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}", self.bind_addr),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    /// How long a partial line from a dropped upload waits for its completion.
    pub partial_line_timeout_secs: u64,
    pub max_line_bytes: usize,
    pub rate_limit_burst: u32,
    pub rate_limit_per_sec: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            partial_line_timeout_secs: DEFAULT_PARTIAL_LINE_TIMEOUT_SECS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            rate_limit_burst: 60,
            rate_limit_per_sec: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerSection {
    pub subscriber_buffer: usize,
    /// Unset means the analyzer channel is unbounded.
    pub analyzer_buffer: Option<usize>,
    pub backlog: usize,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            analyzer_buffer: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl BrokerSection {
    pub fn to_broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            subscriber_buffer: self.subscriber_buffer,
            analyzer_buffer: self.analyzer_buffer,
            backlog: self.backlog,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalyzerSection {
    pub window_records: usize,
    pub window_secs: u64,
    pub bad_record_ratio: f64,
    pub bad_record_min_samples: usize,
    /// Replaces the built-in rule table when non-empty.
    pub rules: Vec<RuleSpec>,
}

impl Default for AnalyzerSection {
    fn default() -> Self {
        let base = AnalyzerConfig::default();
        Self {
            window_records: base.window_records,
            window_secs: base.window_secs,
            bad_record_ratio: base.bad_record_ratio,
            bad_record_min_samples: base.bad_record_min_samples,
            rules: Vec::new(),
        }
    }
}

impl AnalyzerSection {
    pub fn to_analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            window_records: self.window_records,
            window_secs: self.window_secs,
            bad_record_ratio: self.bad_record_ratio,
            bad_record_min_samples: self.bad_record_min_samples,
        }
    }

    pub fn rule_set(&self) -> Result<RuleSet, ExhaustError> {
        if self.rules.is_empty() {
            Ok(RuleSet::default())
        } else {
            RuleSet::compile(self.rules.clone())
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins over it.
    pub filter: Option<String>,
}

impl ExhaustConfig {
    /// Load from an explicit path, the default location, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ExhaustError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };
        match path {
            Some(p) => {
                let text = std::fs::read_to_string(&p)
                    .map_err(|e| ExhaustError::Config(format!("cannot read {}: {e}", p.display())))?;
                Self::from_toml_str(&text)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ExhaustError> {
        let config: Self = toml::from_str(text).map_err(|e| ExhaustError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ExhaustError> {
        if self.ingest.max_line_bytes == 0 {
            return Err(ExhaustError::Config("ingest.max_line_bytes must be positive".into()));
        }
        if self.ingest.rate_limit_burst == 0 {
            return Err(ExhaustError::Config("ingest.rate_limit_burst must be positive".into()));
        }
        if self.ingest.rate_limit_per_sec.is_nan() || self.ingest.rate_limit_per_sec < 0.0 {
            return Err(ExhaustError::Config("ingest.rate_limit_per_sec must not be negative".into()));
        }
        if self.broker.subscriber_buffer == 0 || self.broker.analyzer_buffer == Some(0) {
            return Err(ExhaustError::Config("broker buffers must be positive".into()));
        }
        self.analyzer.to_analyzer_config().validate()?;
        self.analyzer.rule_set()?;
        Ok(())
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("exhaust").join("config.toml"))
}
