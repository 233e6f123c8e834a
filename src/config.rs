use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";
pub const DEFAULT_KEY_FILE: &str = "reality_private.key";
/// Upper bound for every interval, timeout and delay in the file.
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Local agent configuration. Everything here is owned by the node; the
/// `engine.fallback` section is only consulted when the controller cannot be
/// reached at startup.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AgentConfig {
    pub node: NodeSection,
    pub controller: ControllerSection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub intervals: IntervalsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NodeSection {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ControllerSection {
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tls_pin: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FilesSection {
    #[serde(default)]
    pub tls_cert: Option<PathBuf>,
    #[serde(default)]
    pub tls_key: Option<PathBuf>,
    #[serde(default)]
    pub geoip: Option<PathBuf>,
    #[serde(default)]
    pub geosite: Option<PathBuf>,
    #[serde(default)]
    pub engine_config: Option<PathBuf>,
    #[serde(default)]
    pub reality_key: Option<PathBuf>,
}

impl FilesSection {
    pub fn reality_key_path(&self) -> PathBuf {
        self.reality_key
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct EngineSection {
    #[serde(default)]
    pub binary: Option<PathBuf>,
    #[serde(default)]
    pub api_address: String,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub settle_delay_secs: Option<u64>,
    #[serde(default)]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub geoip_url: Option<String>,
    #[serde(default)]
    pub geosite_url: Option<String>,
    #[serde(default)]
    pub fallback: FallbackSection,
}

/// Controller-owned settings as the node operator would like them when the
/// controller is unreachable.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct FallbackSection {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub listen_port: u16,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub inbound_tag: String,
    #[serde(default)]
    pub reality: RealityFallback,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct RealityFallback {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dest: String,
    #[serde(default, deserialize_with = "deserialize_name_list")]
    pub server_names: Vec<String>,
    #[serde(default, deserialize_with = "deserialize_name_list")]
    pub short_ids: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct IntervalsSection {
    #[serde(default)]
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub user_sync_secs: u64,
    #[serde(default)]
    pub traffic_report_secs: u64,
    #[serde(default)]
    pub activity_report_secs: u64,
}

impl IntervalsSection {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn user_sync(&self) -> Duration {
        Duration::from_secs(self.user_sync_secs)
    }

    pub fn traffic_report(&self) -> Duration {
        Duration::from_secs(self.traffic_report_secs)
    }

    pub fn activity_report(&self) -> Duration {
        Duration::from_secs(self.activity_report_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct LoggingSection {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub format: String,
}

/// Accepts either a YAML list or a single comma separated string.
fn deserialize_name_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }

    let raw = Option::<Names>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Names::One(joined)) => split_list(&joined),
        Some(Names::Many(names)) => names
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect(),
        None => Vec::new(),
    })
}

pub fn split_list(joined: &str) -> Vec<String> {
    joined
        .split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

impl AgentConfig {
    pub fn apply_defaults(&mut self) {
        if self.controller.timeout_secs == 0 {
            self.controller.timeout_secs = 10;
        }
        if self.intervals.heartbeat_secs == 0 {
            self.intervals.heartbeat_secs = 30;
        }
        if self.intervals.user_sync_secs == 0 {
            self.intervals.user_sync_secs = 300;
        }
        if self.intervals.traffic_report_secs == 0 {
            self.intervals.traffic_report_secs = 60;
        }
        if self.intervals.activity_report_secs == 0 {
            self.intervals.activity_report_secs = 30;
        }
        if self.logging.level.is_empty() {
            self.logging.level = "info".to_string();
        }
        if self.logging.format.is_empty() {
            self.logging.format = "json".to_string();
        }
        if self.engine.api_address.is_empty() {
            self.engine.api_address = "127.0.0.1".to_string();
        }
        if self.engine.api_port == 0 {
            self.engine.api_port = 10085;
        }
        if self.engine.command_timeout_secs == 0 {
            self.engine.command_timeout_secs = 5;
        }
        if self.engine.settle_delay_secs.is_none() {
            self.engine.settle_delay_secs = Some(2);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.id == 0 {
            return Err(anyhow!("node.id must be > 0"));
        }
        if self.controller.url.trim().is_empty() {
            return Err(anyhow!("controller.url is required"));
        }
        let durations = [
            ("controller.timeout_secs", self.controller.timeout_secs),
            ("intervals.heartbeat_secs", self.intervals.heartbeat_secs),
            ("intervals.user_sync_secs", self.intervals.user_sync_secs),
            ("intervals.traffic_report_secs", self.intervals.traffic_report_secs),
            ("intervals.activity_report_secs", self.intervals.activity_report_secs),
            ("engine.command_timeout_secs", self.engine.command_timeout_secs),
            ("engine.settle_delay_secs", self.engine.settle_delay_secs.unwrap_or(0)),
        ];
        for (field, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(anyhow!(
                    "{} must be at most {} seconds, got {}",
                    field,
                    MAX_DURATION_SECS,
                    secs
                ));
            }
        }
        Ok(())
    }

    pub fn controller_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.engine.settle_delay_secs.unwrap_or(0))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.engine.command_timeout_secs)
    }
}

pub fn parse_config(contents: &str) -> Result<AgentConfig> {
    let mut config: AgentConfig =
        serde_yaml::from_str(contents).context("invalid agent configuration")?;
    config.apply_defaults();
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_config(&contents).with_context(|| format!("failed to load {}", path.display()))
}
