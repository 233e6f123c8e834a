//! In-memory controller and engine used by the unit tests.

use crate::control::{ControlError, Controller};
use crate::engine::{EngineError, IdentitySpec, ProxyEngine, TrafficCounters};
use crate::model::{
    ActivityReportRequest, DesiredIdentity, HeartbeatRequest, NodeConfig, TrafficReportRequest,
};
use crate::resolver::ResolvedRuntimeConfig;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Mutex;

fn unavailable(endpoint: &str) -> ControlError {
    ControlError::Rejected {
        endpoint: endpoint.to_string(),
        message: "controller unavailable".to_string(),
    }
}

#[derive(Default)]
struct ControllerInner {
    reachable: bool,
    node_config: Option<NodeConfig>,
    users: Vec<DesiredIdentity>,
    fail_users: bool,
    user_fetches: usize,
    heartbeats: Vec<HeartbeatRequest>,
    traffic_reports: Vec<TrafficReportRequest>,
    activity_reports: Vec<ActivityReportRequest>,
}

pub struct FakeController {
    inner: Mutex<ControllerInner>,
}

impl FakeController {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ControllerInner {
                reachable: true,
                ..ControllerInner::default()
            }),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            inner: Mutex::new(ControllerInner::default()),
        }
    }

    pub fn set_node_config(&self, config: NodeConfig) {
        self.inner.lock().unwrap().node_config = Some(config);
    }

    pub fn set_users(&self, users: Vec<DesiredIdentity>) {
        self.inner.lock().unwrap().users = users;
    }

    pub fn fail_users(&self, fail: bool) {
        self.inner.lock().unwrap().fail_users = fail;
    }

    pub fn user_fetches(&self) -> usize {
        self.inner.lock().unwrap().user_fetches
    }

    pub fn heartbeats(&self) -> Vec<HeartbeatRequest> {
        self.inner.lock().unwrap().heartbeats.clone()
    }

    pub fn traffic_reports(&self) -> Vec<TrafficReportRequest> {
        self.inner.lock().unwrap().traffic_reports.clone()
    }

    pub fn activity_reports(&self) -> Vec<ActivityReportRequest> {
        self.inner.lock().unwrap().activity_reports.clone()
    }
}

#[async_trait]
impl Controller for FakeController {
    async fn fetch_node_config(&self, _node_id: u64) -> Result<NodeConfig, ControlError> {
        let inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(unavailable("config"));
        }
        inner.node_config.clone().ok_or_else(|| unavailable("config"))
    }

    async fn fetch_desired_users(
        &self,
        _node_id: u64,
    ) -> Result<Vec<DesiredIdentity>, ControlError> {
        let mut inner = self.inner.lock().unwrap();
        inner.user_fetches += 1;
        if !inner.reachable || inner.fail_users {
            return Err(unavailable("sync"));
        }
        Ok(inner.users.clone())
    }

    async fn send_heartbeat(&self, request: &HeartbeatRequest) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(unavailable("heartbeat"));
        }
        inner.heartbeats.push(request.clone());
        Ok(())
    }

    async fn send_traffic_report(
        &self,
        request: &TrafficReportRequest,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(unavailable("traffic"));
        }
        inner.traffic_reports.push(request.clone());
        Ok(())
    }

    async fn send_activity_report(
        &self,
        request: &ActivityReportRequest,
    ) -> Result<(), ControlError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.reachable {
            return Err(unavailable("activity"));
        }
        inner.activity_reports.push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
struct EngineInner {
    running: bool,
    starts: Vec<ResolvedRuntimeConfig>,
    stops: usize,
    identities: HashMap<String, IdentitySpec>,
    added: Vec<String>,
    removed: Vec<String>,
    resets: Vec<String>,
    counters: HashMap<String, TrafficCounters>,
    peers: HashMap<String, BTreeSet<String>>,
    fail_add: HashSet<String>,
    fail_remove: HashSet<String>,
    fail_counters: HashSet<String>,
    fail_start: bool,
}

#[derive(Default)]
pub struct FakeEngine {
    inner: Mutex<EngineInner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self) {
        self.inner.lock().unwrap().fail_start = true;
    }

    pub fn fail_add(&self, identifier: &str) {
        self.inner.lock().unwrap().fail_add.insert(identifier.to_string());
    }

    pub fn fail_remove(&self, identifier: &str) {
        self.inner.lock().unwrap().fail_remove.insert(identifier.to_string());
    }

    pub fn fail_counters(&self, identifier: &str) {
        self.inner.lock().unwrap().fail_counters.insert(identifier.to_string());
    }

    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_add.clear();
        inner.fail_remove.clear();
        inner.fail_counters.clear();
    }

    pub fn set_counters(&self, identifier: &str, upload_bytes: u64, download_bytes: u64) {
        self.inner.lock().unwrap().counters.insert(
            identifier.to_string(),
            TrafficCounters {
                upload_bytes,
                download_bytes,
            },
        );
    }

    pub fn set_peers(&self, identifier: &str, peers: &[&str]) {
        self.inner.lock().unwrap().peers.insert(
            identifier.to_string(),
            peers.iter().map(|peer| peer.to_string()).collect(),
        );
    }

    pub fn starts(&self) -> Vec<ResolvedRuntimeConfig> {
        self.inner.lock().unwrap().starts.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().unwrap().running
    }

    pub fn stops(&self) -> usize {
        self.inner.lock().unwrap().stops
    }

    pub fn identities(&self) -> BTreeSet<String> {
        self.inner.lock().unwrap().identities.keys().cloned().collect()
    }

    pub fn identity(&self, identifier: &str) -> Option<IdentitySpec> {
        self.inner.lock().unwrap().identities.get(identifier).cloned()
    }

    pub fn added(&self) -> Vec<String> {
        self.inner.lock().unwrap().added.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.inner.lock().unwrap().removed.clone()
    }

    pub fn resets(&self) -> Vec<String> {
        self.inner.lock().unwrap().resets.clone()
    }

    pub fn clear_calls(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.added.clear();
        inner.removed.clear();
        inner.resets.clear();
    }
}

#[async_trait]
impl ProxyEngine for FakeEngine {
    async fn start(&self, config: &ResolvedRuntimeConfig) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.starts.push(config.clone());
        if inner.fail_start {
            return Err(EngineError::Start("binary not found".to_string()));
        }
        inner.running = true;
        Ok(())
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stops += 1;
        inner.running = false;
        Ok(())
    }

    async fn add_identity(&self, identity: &IdentitySpec) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.added.push(identity.identifier.clone());
        if inner.fail_add.contains(&identity.identifier) {
            return Err(EngineError::Call {
                operation: "adu".to_string(),
                message: "rejected".to_string(),
            });
        }
        inner
            .identities
            .insert(identity.identifier.clone(), identity.clone());
        Ok(())
    }

    async fn remove_identity(&self, identifier: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.removed.push(identifier.to_string());
        if inner.fail_remove.contains(identifier) {
            return Err(EngineError::Call {
                operation: "rmu".to_string(),
                message: "rejected".to_string(),
            });
        }
        inner.identities.remove(identifier);
        Ok(())
    }

    async fn get_counters(&self, identifier: &str) -> Result<TrafficCounters, EngineError> {
        let inner = self.inner.lock().unwrap();
        if inner.fail_counters.contains(identifier) {
            return Err(EngineError::Timeout {
                operation: "stats".to_string(),
            });
        }
        Ok(inner.counters.get(identifier).copied().unwrap_or_default())
    }

    async fn reset_counters(&self, identifier: &str) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.resets.push(identifier.to_string());
        inner.counters.remove(identifier);
        Ok(())
    }

    async fn online_peers(&self, identifier: &str) -> Result<BTreeSet<String>, EngineError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.peers.get(identifier).cloned().unwrap_or_default())
    }
}
