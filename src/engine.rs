use crate::resolver::{Protocol, ResolvedRuntimeConfig};
use async_trait::async_trait;
use std::collections::BTreeSet;
use thiserror::Error;

/// Flow required by vless clients when the inbound runs the reality transport.
pub const REALITY_FLOW: &str = "xtls-rprx-vision";

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("proxy engine is not running")]
    NotRunning,
    #[error("proxy engine failed to start: {0}")]
    Start(String),
    #[error("proxy engine call {operation} timed out")]
    Timeout { operation: String },
    #[error("proxy engine call {operation} failed: {message}")]
    Call { operation: String, message: String },
    #[error("proxy engine io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything the engine needs to admit one identity on the proxy inbound.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentitySpec {
    pub identifier: String,
    pub credential: String,
    pub protocol: Protocol,
    pub flow: Option<String>,
}

impl IdentitySpec {
    pub fn for_runtime(identifier: &str, credential: &str, runtime: &ResolvedRuntimeConfig) -> Self {
        let flow = if runtime.security.is_reality() && runtime.protocol == Protocol::Vless {
            Some(REALITY_FLOW.to_string())
        } else {
            None
        };
        Self {
            identifier: identifier.to_string(),
            credential: credential.to_string(),
            protocol: runtime.protocol,
            flow,
        }
    }
}

/// Cumulative per-identity byte counters since the last reset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrafficCounters {
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

impl TrafficCounters {
    pub fn is_zero(&self) -> bool {
        self.upload_bytes == 0 && self.download_bytes == 0
    }
}

/// Capability surface the agent consumes from the proxy engine.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn start(&self, config: &ResolvedRuntimeConfig) -> Result<(), EngineError>;

    async fn stop(&self) -> Result<(), EngineError>;

    async fn add_identity(&self, identity: &IdentitySpec) -> Result<(), EngineError>;

    async fn remove_identity(&self, identifier: &str) -> Result<(), EngineError>;

    async fn get_counters(&self, identifier: &str) -> Result<TrafficCounters, EngineError>;

    async fn reset_counters(&self, identifier: &str) -> Result<(), EngineError>;

    async fn online_peers(&self, identifier: &str) -> Result<BTreeSet<String>, EngineError>;
}
