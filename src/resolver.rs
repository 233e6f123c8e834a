//! Merges controller-owned runtime settings with the node's local settings.
//!
//! The controller owns protocol, port, transport security and the inbound tag.
//! The node owns file paths, intervals, engine API location and the reality
//! private key. [`merge`] is a pure function over the two halves so the
//! precedence rules can be checked without a controller.

use crate::config::{split_list, AgentConfig};
use crate::control::Controller;
use crate::keys::KeyPair;
use crate::model::NodeConfig;
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub const CONTROLLER_DEFAULT_INBOUND_TAG: &str = "proxy";
pub const LOCAL_DEFAULT_INBOUND_TAG: &str = "inbound-vless";
pub const LISTEN_ADDRESS: &str = "0.0.0.0";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{mode} mode is enabled but {field} is not configured; configure it in the controller or the local fallback section")]
    MissingField {
        mode: &'static str,
        field: &'static str,
    },
    #[error("listen port is not configured")]
    InvalidPort,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
        }
    }

    fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "vless" => Protocol::Vless,
            "vmess" => Protocol::Vmess,
            other => {
                tracing::warn!(protocol = other, "unsupported protocol, falling back to vless");
                Protocol::Vless
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TlsSettings {
    pub server_name: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RealitySettings {
    pub destination: String,
    pub server_names: Vec<String>,
    pub short_ids: Vec<String>,
    #[serde(skip_serializing)]
    pub private_key: String,
    pub public_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TransportSecurity {
    Plain,
    Tls(TlsSettings),
    Reality(RealitySettings),
}

impl TransportSecurity {
    pub fn is_reality(&self) -> bool {
        matches!(self, TransportSecurity::Reality(_))
    }

    pub fn mode(&self) -> &'static str {
        match self {
            TransportSecurity::Plain => "plain",
            TransportSecurity::Tls(_) => "tls",
            TransportSecurity::Reality(_) => "reality",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Controller,
    Local,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RuntimeIntervals {
    pub heartbeat: Duration,
    pub user_sync: Duration,
    pub traffic_report: Duration,
    pub activity_report: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ResolvedRuntimeConfig {
    pub node_id: u64,
    pub source: ConfigSource,
    pub protocol: Protocol,
    pub listen_address: String,
    pub listen_port: u16,
    pub inbound_tag: String,
    pub api_address: String,
    pub api_port: u16,
    pub security: TransportSecurity,
    pub asset_dir: Option<PathBuf>,
    pub intervals: RuntimeIntervals,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RealityParams {
    pub destination: String,
    pub server_names: Vec<String>,
    pub short_ids: Vec<String>,
    pub private_key: Option<String>,
    pub public_key: Option<String>,
}

/// Fields the controller is allowed to set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerSettings {
    pub protocol: String,
    pub listen_port: u16,
    pub tls_enabled: bool,
    pub sni: String,
    pub inbound_tag: String,
    pub api_port: Option<u16>,
    pub reality: Option<RealityParams>,
}

impl From<NodeConfig> for ControllerSettings {
    fn from(node: NodeConfig) -> Self {
        let reality = node.reality_enabled.then(|| RealityParams {
            destination: node.reality_dest.trim().to_string(),
            server_names: split_list(&node.reality_server_names),
            short_ids: split_list(&node.reality_short_ids),
            private_key: non_empty(node.reality_private_key),
            public_key: non_empty(node.reality_public_key),
        });
        Self {
            protocol: node.protocol,
            listen_port: node.port,
            tls_enabled: node.tls_enabled,
            sni: node.sni,
            inbound_tag: node.inbound_tag,
            api_port: (node.api_port > 0).then_some(node.api_port),
            reality,
        }
    }
}

/// Fields only the node decides, plus the fallback copy of the
/// controller-owned fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalSettings {
    pub node_id: u64,
    pub api_address: String,
    pub api_port: u16,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub asset_dir: Option<PathBuf>,
    pub intervals: RuntimeIntervals,
    pub fallback: ControllerSettings,
}

impl LocalSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let fallback = &config.engine.fallback;
        let reality = fallback.reality.enabled.then(|| RealityParams {
            destination: fallback.reality.dest.trim().to_string(),
            server_names: fallback.reality.server_names.clone(),
            short_ids: fallback.reality.short_ids.clone(),
            private_key: None,
            public_key: None,
        });
        Self {
            node_id: config.node.id,
            api_address: config.engine.api_address.clone(),
            api_port: config.engine.api_port,
            tls_cert: config.files.tls_cert.clone(),
            tls_key: config.files.tls_key.clone(),
            asset_dir: config
                .files
                .geoip
                .as_ref()
                .and_then(|path| path.parent())
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.to_path_buf()),
            intervals: RuntimeIntervals {
                heartbeat: config.intervals.heartbeat(),
                user_sync: config.intervals.user_sync(),
                traffic_report: config.intervals.traffic_report(),
                activity_report: config.intervals.activity_report(),
            },
            fallback: ControllerSettings {
                protocol: fallback.protocol.clone(),
                listen_port: fallback.listen_port,
                tls_enabled: fallback.tls_enabled,
                sni: fallback.sni.clone(),
                inbound_tag: fallback.inbound_tag.clone(),
                api_port: None,
                reality,
            },
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn supplied_or(value: &str, fallback: &str) -> String {
    if value.trim().is_empty() {
        fallback.to_string()
    } else {
        value.to_string()
    }
}

fn supplied_list_or(values: &[String], fallback: &[String]) -> Vec<String> {
    if values.is_empty() {
        fallback.to_vec()
    } else {
        values.to_vec()
    }
}

impl RealityParams {
    fn or_fallback(&self, fallback: Option<&RealityParams>) -> Self {
        let Some(fallback) = fallback else {
            return self.clone();
        };
        Self {
            destination: supplied_or(&self.destination, &fallback.destination),
            server_names: supplied_list_or(&self.server_names, &fallback.server_names),
            short_ids: supplied_list_or(&self.short_ids, &fallback.short_ids),
            private_key: self.private_key.clone().or_else(|| fallback.private_key.clone()),
            public_key: self.public_key.clone().or_else(|| fallback.public_key.clone()),
        }
    }
}

impl ControllerSettings {
    /// Keeps every field the controller supplied and takes the rest from
    /// `fallback`. The security flags are always taken from the controller.
    fn or_fallback(&self, fallback: &ControllerSettings) -> Self {
        Self {
            protocol: supplied_or(&self.protocol, &fallback.protocol),
            listen_port: if self.listen_port > 0 {
                self.listen_port
            } else {
                fallback.listen_port
            },
            tls_enabled: self.tls_enabled,
            sni: supplied_or(&self.sni, &fallback.sni),
            inbound_tag: supplied_or(&self.inbound_tag, &fallback.inbound_tag),
            api_port: self.api_port.or(fallback.api_port),
            reality: self
                .reality
                .as_ref()
                .map(|reality| reality.or_fallback(fallback.reality.as_ref())),
        }
    }
}

/// Combines both halves into the runtime configuration, rejecting
/// security-sensitive modes that are only partially specified.
pub fn merge(
    local: &LocalSettings,
    controller: Option<&ControllerSettings>,
    keys: Option<&KeyPair>,
) -> Result<ResolvedRuntimeConfig, ResolveError> {
    let (owned, source, default_tag) = match controller {
        Some(settings) => (
            settings.or_fallback(&local.fallback),
            ConfigSource::Controller,
            CONTROLLER_DEFAULT_INBOUND_TAG,
        ),
        None => (local.fallback.clone(), ConfigSource::Local, LOCAL_DEFAULT_INBOUND_TAG),
    };

    if owned.listen_port == 0 {
        return Err(ResolveError::InvalidPort);
    }

    let inbound_tag = if owned.inbound_tag.trim().is_empty() {
        tracing::warn!(default = default_tag, "inbound tag is empty, using default");
        default_tag.to_string()
    } else {
        owned.inbound_tag.trim().to_string()
    };

    let security = if let Some(reality) = owned.reality.as_ref() {
        TransportSecurity::Reality(resolve_reality(reality, keys)?)
    } else if owned.tls_enabled {
        let cert_file = local.tls_cert.clone().ok_or(ResolveError::MissingField {
            mode: "tls",
            field: "files.tls_cert",
        })?;
        let key_file = local.tls_key.clone().ok_or(ResolveError::MissingField {
            mode: "tls",
            field: "files.tls_key",
        })?;
        TransportSecurity::Tls(TlsSettings {
            server_name: owned.sni.trim().to_string(),
            cert_file,
            key_file,
        })
    } else {
        TransportSecurity::Plain
    };

    Ok(ResolvedRuntimeConfig {
        node_id: local.node_id,
        source,
        protocol: Protocol::from_name(&owned.protocol),
        listen_address: LISTEN_ADDRESS.to_string(),
        listen_port: owned.listen_port,
        inbound_tag,
        api_address: local.api_address.clone(),
        api_port: owned.api_port.unwrap_or(local.api_port),
        security,
        asset_dir: local.asset_dir.clone(),
        intervals: local.intervals.clone(),
    })
}

fn resolve_reality(
    reality: &RealityParams,
    keys: Option<&KeyPair>,
) -> Result<RealitySettings, ResolveError> {
    let missing = |field| ResolveError::MissingField {
        mode: "reality",
        field,
    };
    if reality.destination.is_empty() {
        return Err(missing("target destination"));
    }
    if reality.server_names.is_empty() {
        return Err(missing("server names"));
    }
    if reality.short_ids.is_empty() {
        return Err(missing("short ids"));
    }

    let (private_key, public_key) = match keys {
        Some(keys) => (keys.private_key.clone(), keys.public_key.clone()),
        None => {
            let private_key = reality
                .private_key
                .clone()
                .ok_or_else(|| missing("private key"))?;
            tracing::warn!("using controller-provided reality keys, local keypair unavailable");
            (private_key, reality.public_key.clone().unwrap_or_default())
        }
    };

    Ok(RealitySettings {
        destination: reality.destination.clone(),
        server_names: reality.server_names.clone(),
        short_ids: reality.short_ids.clone(),
        private_key,
        public_key,
    })
}

/// Fetches the controller's view of this node and merges it with the local
/// settings. An unreachable controller is not fatal; an incomplete mode is.
pub async fn resolve(
    controller: &dyn Controller,
    local: &LocalSettings,
    keys: Option<&KeyPair>,
) -> Result<ResolvedRuntimeConfig, ResolveError> {
    match controller.fetch_node_config(local.node_id).await {
        Ok(node) => {
            let settings = ControllerSettings::from(node);
            tracing::info!(
                protocol = %settings.protocol,
                port = settings.listen_port,
                tls = settings.tls_enabled,
                reality = settings.reality.is_some(),
                "using controller node configuration"
            );
            merge(local, Some(&settings), keys)
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to fetch node config, using local configuration");
            merge(local, None, keys)
        }
    }
}
