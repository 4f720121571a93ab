//! Agent configuration
//!
//! Two layers:
//!
//! - [`Settings`]: daemon settings (endpoints, intervals, API port) from TOML
//! - [`AgentConfig`]: the operating configuration (metric index, proposal
//!   rules, action map) from YAML or JSON. It is accepted in the loose
//!   parallel-list schema operators write and validated once into typed rules.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ledger::ActionValue;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unsupported configuration format: {}", .0.display())]
    UnsupportedFormat(PathBuf),

    #[error("No operating configuration path given")]
    MissingOperatingConfig,

    #[error("metric_index must not be empty")]
    EmptyMetricIndex,

    #[error("propose_on defines no rules")]
    EmptyRules,

    #[error("propose_on has {events} events but {contents} proposal_contents")]
    MismatchedRuleLists { events: usize, contents: usize },

    #[error("propose_on has more positive_vote_on entries ({votes}) than events ({events})")]
    TooManyVoteConditions { votes: usize, events: usize },

    #[error("Rule {0}: event expression is empty")]
    EmptyExpression(usize),

    #[error("Rule {0}: proposal message is empty")]
    EmptyMessage(usize),

    #[error("actions_map['{key}']: {reason}")]
    InvalidAction { key: String, reason: String },
}

//=============================================================================
// DAEMON SETTINGS
//=============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub node: NodeSettings,
    #[serde(default)]
    pub telemetry: TelemetrySettings,
    #[serde(default)]
    pub ledger: LedgerSettings,
    #[serde(default)]
    pub agent: AgentSettings,
    #[serde(default)]
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Agent identity; falls back to the hostname
    #[serde(default)]
    pub device_name: Option<String>,

    /// Path to the operating configuration (YAML or JSON)
    #[serde(default)]
    pub operating_config: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    /// Base URL of the Prometheus-compatible query API
    #[serde(default = "default_query_url")]
    pub query_url: String,

    /// Prefix prepended to metric names by the query compiler
    #[serde(default = "default_metric_prefix")]
    pub metric_prefix: String,

    #[serde(default = "default_telemetry_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    /// Signing ledger gateway
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,

    /// Upper bound on any single ledger call
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Sleep between worker iterations
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Timeout for action endpoint POSTs
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

// Defaults
fn default_query_url() -> String { "http://thanos-query.default.svc.cluster.local:9090".to_string() }
fn default_metric_prefix() -> String { "oasees_".to_string() }
fn default_telemetry_timeout() -> u64 { 5 }
fn default_gateway_url() -> String { "http://127.0.0.1:8545".to_string() }
fn default_call_timeout() -> u64 { 30 }
fn default_poll_interval() -> u64 { 5 }
fn default_dispatch_timeout() -> u64 { 10 }
fn default_true() -> bool { true }
fn default_http_port() -> u16 { 8088 }

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            query_url: default_query_url(),
            metric_prefix: default_metric_prefix(),
            timeout_secs: default_telemetry_timeout(),
        }
    }
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            gateway_url: default_gateway_url(),
            call_timeout_secs: default_call_timeout(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            dispatch_timeout_secs: default_dispatch_timeout(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            http_port: default_http_port(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            telemetry: TelemetrySettings::default(),
            ledger: LedgerSettings::default(),
            agent: AgentSettings::default(),
            api: ApiSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Agent identity: configured name, else hostname
    pub fn device_name(&self) -> String {
        self.node.device_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.agent.poll_interval_secs)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

//=============================================================================
// OPERATING CONFIGURATION
//=============================================================================

/// A rule that raises a proposal when its event expression fires
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProposalRule {
    /// Event expression compiled into the trigger query
    pub event: String,
    /// Proposal message; also the cooldown key
    pub message: String,
    /// Value the proposal would write to the store
    pub action_value: ActionValue,
    /// Expression whose result sets the vote decision
    pub vote_condition: Option<String>,
}

/// Where to dispatch when the store takes a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEndpoint {
    pub action_endpoint: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

/// Validated operating configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub metric_index: String,
    pub rules: Vec<ProposalRule>,
    /// Keyed by the store value rendered as a decimal string
    pub actions_map: BTreeMap<String, ActionEndpoint>,
}

/// Operating configuration as written on disk
#[derive(Debug, Clone, Deserialize)]
pub struct RawAgentConfig {
    pub metric_index: String,
    pub propose_on: RawProposeOn,
    #[serde(default)]
    pub actions_map: BTreeMap<String, ActionEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProposeOn {
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub proposal_contents: Vec<RawProposalContent>,
    #[serde(default)]
    pub positive_vote_on: Vec<Option<String>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProposalContent {
    pub msg: String,
    pub action_value: ActionValue,
}

impl TryFrom<RawAgentConfig> for AgentConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAgentConfig) -> Result<Self, Self::Error> {
        let RawProposeOn {
            events,
            proposal_contents,
            positive_vote_on,
        } = raw.propose_on;

        if events.is_empty() {
            return Err(ConfigError::EmptyRules);
        }
        if events.len() != proposal_contents.len() {
            return Err(ConfigError::MismatchedRuleLists {
                events: events.len(),
                contents: proposal_contents.len(),
            });
        }
        if positive_vote_on.len() > events.len() {
            return Err(ConfigError::TooManyVoteConditions {
                votes: positive_vote_on.len(),
                events: events.len(),
            });
        }

        let mut votes = positive_vote_on.into_iter();
        let rules = events
            .into_iter()
            .zip(proposal_contents)
            .map(|(event, content)| ProposalRule {
                event,
                message: content.msg,
                action_value: content.action_value,
                vote_condition: votes
                    .next()
                    .flatten()
                    .filter(|expr| !expr.trim().is_empty()),
            })
            .collect();

        // Keys are written as "2", " 2" or "02"; store them in canonical form
        let mut actions_map = BTreeMap::new();
        for (key, endpoint) in raw.actions_map {
            let value: ActionValue = key.parse().map_err(|_| ConfigError::InvalidAction {
                key: key.clone(),
                reason: "key is not a store value".to_string(),
            })?;
            actions_map.insert(value.to_string(), endpoint);
        }

        let config = Self {
            metric_index: raw.metric_index.trim().to_string(),
            rules,
            actions_map,
        };
        config.validate()?;
        Ok(config)
    }
}

impl AgentConfig {
    /// Check the invariants every running configuration must hold
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.metric_index.trim().is_empty() {
            return Err(ConfigError::EmptyMetricIndex);
        }
        if self.rules.is_empty() {
            return Err(ConfigError::EmptyRules);
        }

        for (idx, rule) in self.rules.iter().enumerate() {
            if rule.event.trim().is_empty() {
                return Err(ConfigError::EmptyExpression(idx));
            }
            if rule.message.trim().is_empty() {
                return Err(ConfigError::EmptyMessage(idx));
            }
        }

        for (key, endpoint) in &self.actions_map {
            match key.parse::<ActionValue>() {
                Ok(value) if value.to_string() == *key => {}
                _ => {
                    return Err(ConfigError::InvalidAction {
                        key: key.clone(),
                        reason: "key is not a store value".to_string(),
                    })
                }
            }
            let url = &endpoint.action_endpoint;
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidAction {
                    key: key.clone(),
                    reason: format!("endpoint '{}' is not an http(s) URL", url),
                });
            }
        }

        Ok(())
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawAgentConfig = serde_yaml::from_str(content)?;
        raw.try_into()
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawAgentConfig = serde_json::from_str(content)?;
        raw.try_into()
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let raw: RawAgentConfig = serde_json::from_value(value)?;
        raw.try_into()
    }

    /// Load from a `.yaml`/`.yml` or `.json` file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = read(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }

    /// Endpoint configured for a store value
    pub fn action_for(&self, value: ActionValue) -> Option<&ActionEndpoint> {
        self.actions_map.get(&value.to_string())
    }
}
