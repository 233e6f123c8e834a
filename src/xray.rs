//! Xray-core backed implementation of [`ProxyEngine`].
//!
//! The engine runs as a child process. Identity and counter operations go
//! through the `xray api` subcommands against the engine's API inbound, each
//! bounded by the configured command timeout.

use crate::config::AgentConfig;
use crate::engine::{EngineError, IdentitySpec, ProxyEngine, TrafficCounters};
use crate::resolver::{Protocol, ResolvedRuntimeConfig, TransportSecurity};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};

pub const DEFAULT_BINARY: &str = "xray";
pub const DEBUG_CONFIG_PATH: &str = "/tmp/xray-config.json";
pub const API_TAG: &str = "api";
pub const ASSET_ENV: &str = "XRAY_LOCATION_ASSET";

/// Renders the full engine configuration for a resolved runtime.
pub fn render_config(runtime: &ResolvedRuntimeConfig) -> Value {
    json!({
        "log": {"loglevel": "warning"},
        "api": {
            "tag": API_TAG,
            "services": ["HandlerService", "StatsService"],
        },
        "stats": {},
        "policy": {
            "levels": {
                "0": {"statsUserUplink": true, "statsUserDownlink": true},
            },
            "system": {"statsInboundUplink": true, "statsInboundDownlink": true},
        },
        "inbounds": [
            {
                "tag": API_TAG,
                "listen": runtime.api_address,
                "port": runtime.api_port,
                "protocol": "dokodemo-door",
                "settings": {"address": runtime.api_address},
            },
            proxy_inbound(runtime),
        ],
        "outbounds": [
            {"protocol": "freedom", "tag": "direct"},
        ],
        "routing": {
            "domainStrategy": "AsIs",
            "rules": [
                {"type": "field", "inboundTag": [API_TAG], "outboundTag": API_TAG},
            ],
        },
    })
}

fn inbound_settings(protocol: Protocol, clients: Vec<Value>) -> Value {
    match protocol {
        Protocol::Vless => json!({"clients": clients, "decryption": "none"}),
        Protocol::Vmess => json!({"clients": clients}),
    }
}

fn proxy_inbound(runtime: &ResolvedRuntimeConfig) -> Value {
    let mut inbound = json!({
        "tag": runtime.inbound_tag,
        "listen": runtime.listen_address,
        "port": runtime.listen_port,
        "protocol": runtime.protocol.as_str(),
        "settings": inbound_settings(runtime.protocol, Vec::new()),
    });
    let stream = match &runtime.security {
        TransportSecurity::Plain => None,
        TransportSecurity::Tls(tls) => Some(json!({
            "network": "tcp",
            "security": "tls",
            "tlsSettings": {
                "serverName": tls.server_name,
                "certificates": [
                    {"certificateFile": tls.cert_file, "keyFile": tls.key_file},
                ],
            },
        })),
        TransportSecurity::Reality(reality) => Some(json!({
            "network": "tcp",
            "security": "reality",
            "realitySettings": {
                "show": false,
                "dest": reality.destination,
                "xver": 0,
                "serverNames": reality.server_names,
                "privateKey": reality.private_key,
                "shortIds": reality.short_ids,
            },
        })),
    };
    if let (Some(stream), Some(object)) = (stream, inbound.as_object_mut()) {
        object.insert("streamSettings".to_string(), stream);
    }
    inbound
}

fn client_entry(identity: &IdentitySpec) -> Value {
    let mut client = json!({
        "id": identity.credential,
        "email": identity.identifier,
        "level": 0,
    });
    if let (Some(flow), Some(object)) = (identity.flow.as_ref(), client.as_object_mut()) {
        object.insert("flow".to_string(), Value::String(flow.clone()));
    }
    client
}

/// Payload accepted by `xray api adu`: an inbound stub carrying one client.
fn add_user_payload(inbound_tag: &str, identity: &IdentitySpec) -> Value {
    json!({
        "inbounds": [{
            "tag": inbound_tag,
            "protocol": identity.protocol.as_str(),
            "settings": inbound_settings(identity.protocol, vec![client_entry(identity)]),
        }],
    })
}

fn counter_name(identifier: &str, direction: &str) -> String {
    format!("user>>>{}>>>traffic>>>{}", identifier, direction)
}

fn lenient_u64(value: &Value) -> u64 {
    match value {
        Value::Number(number) => number
            .as_u64()
            .or_else(|| number.as_i64().map(|n| n.max(0) as u64))
            .unwrap_or(0),
        Value::String(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Reads the counter value out of `xray api stats` output.
fn parse_stat_value(output: &str) -> Result<u64, String> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(0);
    }
    let parsed: Value =
        serde_json::from_str(output).map_err(|err| format!("unreadable stats output: {}", err))?;
    let value = parsed
        .get("stat")
        .and_then(|stat| stat.get("value"))
        .or_else(|| parsed.get("value"))
        .map(lenient_u64)
        .unwrap_or(0);
    Ok(value)
}

/// Reads peer addresses out of `xray api statsonlineiplist` output.
fn parse_online_ips(output: &str) -> Result<BTreeSet<String>, String> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(BTreeSet::new());
    }
    let parsed: Value =
        serde_json::from_str(output).map_err(|err| format!("unreadable ip list output: {}", err))?;
    let ips = match parsed.get("ips") {
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        Some(Value::Array(list)) => list
            .iter()
            .filter_map(|entry| entry.as_str().map(str::to_string))
            .collect(),
        _ => BTreeSet::new(),
    };
    Ok(ips)
}

fn is_missing_counter(message: &str) -> bool {
    message.to_ascii_lowercase().contains("not found")
}

#[derive(Clone, Debug)]
struct ApiTarget {
    server: String,
    inbound_tag: String,
}

pub struct XrayEngine {
    binary: PathBuf,
    config_path: Option<PathBuf>,
    debug_path: PathBuf,
    command_timeout: Duration,
    child: Mutex<Option<Child>>,
    target: RwLock<Option<ApiTarget>>,
}

impl XrayEngine {
    pub fn new(binary: PathBuf, config_path: Option<PathBuf>, command_timeout: Duration) -> Self {
        Self {
            binary,
            config_path,
            debug_path: PathBuf::from(DEBUG_CONFIG_PATH),
            command_timeout,
            child: Mutex::new(None),
            target: RwLock::new(None),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(
            config
                .engine
                .binary
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY)),
            config.files.engine_config.clone(),
            config.command_timeout(),
        )
    }

    pub fn with_debug_path(mut self, path: PathBuf) -> Self {
        self.debug_path = path;
        self
    }

    async fn write_config(&self, rendered: &[u8]) -> Result<PathBuf, EngineError> {
        write_file(&self.debug_path, rendered)
            .await
            .map_err(|err| EngineError::Start(format!("failed to save {}: {}", self.debug_path.display(), err)))?;
        tracing::info!(path = %self.debug_path.display(), "engine config saved");

        if let Some(path) = self.config_path.as_ref() {
            match write_file(path, rendered).await {
                Ok(()) => return Ok(path.clone()),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "failed to save engine config file");
                }
            }
        }
        Ok(self.debug_path.clone())
    }

    async fn target(&self) -> Result<ApiTarget, EngineError> {
        self.target.read().await.clone().ok_or(EngineError::NotRunning)
    }

    async fn run_api(&self, operation: &str, args: &[String]) -> Result<String, EngineError> {
        let target = self.target().await?;
        let mut command = Command::new(&self.binary);
        command
            .arg("api")
            .arg(operation)
            .arg(format!("--server={}", target.server))
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Timeout {
                    operation: operation.to_string(),
                })
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let message = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(EngineError::Call {
                operation: operation.to_string(),
                message: format!("{}: {}", output.status, message),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn query_counter(&self, identifier: &str, direction: &str, reset: bool) -> Result<u64, EngineError> {
        let mut args = vec!["-name".to_string(), counter_name(identifier, direction)];
        if reset {
            args.push("-reset".to_string());
        }
        match self.run_api("stats", &args).await {
            Ok(output) => parse_stat_value(&output).map_err(|message| EngineError::Call {
                operation: "stats".to_string(),
                message,
            }),
            Err(EngineError::Call { message, .. }) if is_missing_counter(&message) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

async fn write_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    tokio::fs::write(path, contents).await
}

#[async_trait]
impl ProxyEngine for XrayEngine {
    async fn start(&self, config: &ResolvedRuntimeConfig) -> Result<(), EngineError> {
        let mut child_slot = self.child.lock().await;
        if child_slot.is_some() {
            return Err(EngineError::Start("engine already running".to_string()));
        }

        let rendered = serde_json::to_vec_pretty(&render_config(config))
            .map_err(|err| EngineError::Start(format!("failed to render config: {}", err)))?;
        let config_path = self.write_config(&rendered).await?;

        let mut command = Command::new(&self.binary);
        command
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(asset_dir) = config.asset_dir.as_ref() {
            command.env(ASSET_ENV, asset_dir);
            tracing::info!(asset_dir = %asset_dir.display(), "engine asset directory set");
        }
        let mut child = command.spawn().map_err(|err| {
            EngineError::Start(format!("failed to spawn {}: {}", self.binary.display(), err))
        })?;
        if let Some(status) = child.try_wait()? {
            return Err(EngineError::Start(format!(
                "engine exited immediately with {}",
                status
            )));
        }

        tracing::info!(
            pid = child.id().unwrap_or_default(),
            protocol = config.protocol.as_str(),
            port = config.listen_port,
            security = config.security.mode(),
            "engine started"
        );
        *child_slot = Some(child);
        *self.target.write().await = Some(ApiTarget {
            server: format!("{}:{}", config.api_address, config.api_port),
            inbound_tag: config.inbound_tag.clone(),
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut child_slot = self.child.lock().await;
        self.target.write().await.take();
        let Some(mut child) = child_slot.take() else {
            return Ok(());
        };
        if child.try_wait()?.is_none() {
            child.start_kill()?;
        }
        let status = child.wait().await?;
        tracing::info!(status = %status, "engine stopped");
        Ok(())
    }

    async fn add_identity(&self, identity: &IdentitySpec) -> Result<(), EngineError> {
        let target = self.target().await?;
        let payload = serde_json::to_vec(&add_user_payload(&target.inbound_tag, identity))
            .map_err(|err| EngineError::Call {
                operation: "adu".to_string(),
                message: err.to_string(),
            })?;
        // Owner-only file with a random name, deleted on drop.
        let mut file = tempfile::Builder::new()
            .prefix("fleetnode-adu-")
            .suffix(".json")
            .tempfile()?;
        file.write_all(&payload)?;
        file.flush()?;
        self.run_api("adu", &[file.path().to_string_lossy().into_owned()])
            .await
            .map(|_| ())
    }

    async fn remove_identity(&self, identifier: &str) -> Result<(), EngineError> {
        let target = self.target().await?;
        self.run_api(
            "rmu",
            &[format!("-tag={}", target.inbound_tag), identifier.to_string()],
        )
        .await
        .map(|_| ())
    }

    async fn get_counters(&self, identifier: &str) -> Result<TrafficCounters, EngineError> {
        Ok(TrafficCounters {
            upload_bytes: self.query_counter(identifier, "uplink", false).await?,
            download_bytes: self.query_counter(identifier, "downlink", false).await?,
        })
    }

    async fn reset_counters(&self, identifier: &str) -> Result<(), EngineError> {
        self.query_counter(identifier, "uplink", true).await?;
        self.query_counter(identifier, "downlink", true).await?;
        Ok(())
    }

    async fn online_peers(&self, identifier: &str) -> Result<BTreeSet<String>, EngineError> {
        let output = self
            .run_api(
                "statsonlineiplist",
                &["-email".to_string(), identifier.to_string()],
            )
            .await?;
        parse_online_ips(&output).map_err(|message| EngineError::Call {
            operation: "statsonlineiplist".to_string(),
            message,
        })
    }
}
