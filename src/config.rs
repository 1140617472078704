use crate::error::{MelodyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Top-level configuration for the melody sensor core.
///
/// Loaded via [`MelodyConfig::from_file`], which layers a named file with
/// `MELODY_`-prefixed environment overrides the same way the teacher
/// platform layers `SECBEAT_` overrides onto its own config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MelodyConfig {
    /// Sensor-wide settings: which layers are observed and basic caps.
    pub sensor: SensorConfig,
    /// Rule engine settings: where rules live, how evaluation is bounded.
    pub rules: RulesConfig,
    /// Session registry eviction policy.
    pub sessions: SessionConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
    /// Metrics exporter configuration.
    pub metrics: MetricsConfig,
    /// Management/admin HTTP surface.
    pub management: ManagementConfig,
}

/// Which event layers are active and global body/record caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Event kinds this sensor observes: "http", "https", "tcp", "udp",
    /// "icmp". Layers not listed here are never evaluated even if an
    /// event of that kind somehow arrives.
    pub active_layers: Vec<String>,
    /// Maximum number of body/payload bytes retained and inspected per
    /// event; bodies larger than this are truncated and flagged.
    pub max_body_bytes: usize,
}

/// Rule loader and evaluator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Root directory walked recursively for `.yml` rule files.
    pub rules_dir: String,
    /// File/directory basenames ignored by the loader (e.g. marker
    /// files, README, hidden dotfiles).
    #[serde(default = "RulesConfig::default_skip_list")]
    pub skip_list: Vec<String>,
    /// Best-effort per-rule evaluation deadline in milliseconds.
    pub regex_timeout_ms: u64,
}

impl RulesConfig {
    fn default_skip_list() -> Vec<String> {
        vec![
            ".gitkeep".to_string(),
            "README.md".to_string(),
            ".DS_Store".to_string(),
        ]
    }
}

/// Session registry eviction policy. Exactly one of `max_sessions` or
/// `session_ttl_seconds` must be set — see spec §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// LRU cap on the number of live sessions. Mutually exclusive with
    /// `session_ttl_seconds`.
    pub max_sessions: Option<usize>,
    /// TTL from last access, in seconds. Mutually exclusive with
    /// `max_sessions`.
    pub session_ttl_seconds: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default `tracing` filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Emit logs as JSON instead of the human-readable formatter.
    pub json: bool,
}

/// Prometheus metrics exporter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

/// Admin/management HTTP surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagementConfig {
    pub enabled: bool,
    pub listen_addr: String,
    /// Bearer token required on `/control/terminate`.
    pub auth_token: String,
    /// Grace period honored on termination requests.
    pub shutdown_grace_period_seconds: u64,
}

impl Default for MelodyConfig {
    fn default() -> Self {
        Self {
            sensor: SensorConfig {
                active_layers: vec![
                    "http".to_string(),
                    "https".to_string(),
                    "tcp".to_string(),
                ],
                max_body_bytes: 65536,
            },
            rules: RulesConfig {
                rules_dir: "rules".to_string(),
                skip_list: RulesConfig::default_skip_list(),
                regex_timeout_ms: 5,
            },
            sessions: SessionConfig {
                max_sessions: Some(100_000),
                session_ttl_seconds: None,
            },
            logging: LoggingConfig {
                default_filter: "melody=info".to_string(),
                json: false,
            },
            metrics: MetricsConfig {
                enabled: true,
                listen_addr: "0.0.0.0:9100".to_string(),
            },
            management: ManagementConfig {
                enabled: true,
                listen_addr: "127.0.0.1:7999".to_string(),
                auth_token: "dev-melody-token-not-for-production".to_string(),
                shutdown_grace_period_seconds: 5,
            },
        }
    }
}

impl MelodyConfig {
    /// Load configuration from a named file (extension-less, resolved by
    /// the `config` crate), layered with `MELODY_`-prefixed environment
    /// variable overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MELODY").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(MelodyError::from)
    }

    /// Validate cross-field invariants not expressible in the type alone.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.rules.rules_dir.trim().is_empty() {
            return Err("rules.rules_dir cannot be empty".to_string());
        }

        if self.sensor.max_body_bytes == 0 {
            return Err("sensor.max_body_bytes must be greater than zero".to_string());
        }

        for layer in &self.sensor.active_layers {
            if layer_kind_from_str(layer).is_none() {
                return Err(format!("sensor.active_layers: unknown layer '{layer}'"));
            }
        }

        match (self.sessions.max_sessions, self.sessions.session_ttl_seconds) {
            (Some(_), None) | (None, Some(_)) => {}
            (Some(_), Some(_)) => {
                return Err(
                    "sessions: exactly one of max_sessions or session_ttl_seconds must be set, not both"
                        .to_string(),
                )
            }
            (None, None) => {
                return Err(
                    "sessions: exactly one of max_sessions or session_ttl_seconds must be set"
                        .to_string(),
                )
            }
        }

        if self.management.enabled && self.management.auth_token.trim().is_empty() {
            return Err("management.auth_token cannot be empty when management is enabled".to_string());
        }

        Ok(())
    }
}

fn layer_kind_from_str(s: &str) -> Option<&'static str> {
    match s.to_ascii_lowercase().as_str() {
        "http" => Some("http"),
        "https" => Some("https"),
        "tcp" => Some("tcp"),
        "udp" => Some("udp"),
        "icmp" | "icmpv4" | "icmpv6" => Some("icmp"),
        _ => None,
    }
}

/// Carried-through free-form metadata, used by [`crate::rule::RuleMeta`]
/// and the log projector's `additional` section.
pub type AnnotationMap = HashMap<String, String>;
