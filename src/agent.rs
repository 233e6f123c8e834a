use crate::activity::report_activity;
use crate::config::AgentConfig;
use crate::control::{ControlError, Controller};
use crate::engine::ProxyEngine;
use crate::geodata::{self, GeoAssets};
use crate::host;
use crate::keys::{self, KeyPair};
use crate::model::HeartbeatRequest;
use crate::periodic;
use crate::reconcile::reconcile;
use crate::resolver::{resolve, LocalSettings, ResolvedRuntimeConfig};
use crate::state::AgentState;
use crate::traffic::report_traffic;
use anyhow::{anyhow, Context, Result};
use std::future::Future;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Owns the shared state and drives the node through its lifecycle.
pub struct Agent {
    config: AgentConfig,
    controller: Arc<dyn Controller>,
    engine: Arc<dyn ProxyEngine>,
    geo: Option<Arc<GeoAssets>>,
    state: Arc<AgentState>,
    phase: Phase,
    keys: Option<KeyPair>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        controller: Arc<dyn Controller>,
        engine: Arc<dyn ProxyEngine>,
    ) -> Self {
        Self {
            config,
            controller,
            engine,
            geo: None,
            state: Arc::new(AgentState::new()),
            phase: Phase::Created,
            keys: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn with_geo_assets(mut self, geo: Option<GeoAssets>) -> Self {
        self.geo = geo.map(Arc::new);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> Arc<AgentState> {
        self.state.clone()
    }

    pub fn public_key(&self) -> Option<&str> {
        self.keys.as_ref().map(|keys| keys.public_key.as_str())
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Created {
            return Err(anyhow!("agent cannot start from {:?}", self.phase));
        }
        self.phase = Phase::Starting;
        match self.start_inner().await {
            Ok(()) => {
                self.phase = Phase::Running;
                tracing::info!(node_id = self.config.node.id, "agent running");
                Ok(())
            }
            Err(err) => {
                self.cancel.cancel();
                self.phase = Phase::Stopped;
                Err(err)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<()> {
        let key_path = self.config.files.reality_key_path();
        match keys::load_or_create(&key_path) {
            Ok(loaded) => {
                tracing::info!(
                    path = %key_path.display(),
                    public_key = %loaded.keys.public_key,
                    generated = loaded.is_new,
                    "reality keypair ready"
                );
                self.keys = Some(loaded.keys);
            }
            Err(err) => {
                tracing::warn!(path = %key_path.display(), error = %format!("{:#}", err), "failed to load reality keypair");
            }
        }

        let local = LocalSettings::from_config(&self.config);
        let runtime = resolve(self.controller.as_ref(), &local, self.keys.as_ref())
            .await
            .context("invalid runtime configuration")?;
        tracing::info!(
            source = ?runtime.source,
            protocol = runtime.protocol.as_str(),
            port = runtime.listen_port,
            inbound_tag = %runtime.inbound_tag,
            security = runtime.security.mode(),
            "runtime configuration resolved"
        );
        let runtime = Arc::new(runtime);

        if let Some(geo) = self.geo.as_ref() {
            if let Err(err) = geo.ensure().await {
                tracing::warn!(error = %format!("{:#}", err), "failed to prepare geo data files");
            }
        }

        self.engine
            .start(&runtime)
            .await
            .context("failed to start proxy engine")?;

        let settle = self.config.settle_delay();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        if let Err(err) = reconcile(
            self.controller.as_ref(),
            self.engine.as_ref(),
            &self.state,
            &runtime,
        )
        .await
        {
            tracing::warn!(error = %err, "initial identity sync failed");
        }

        self.spawn_loops(runtime);
        Ok(())
    }

    fn spawn_loops(&mut self, runtime: Arc<ResolvedRuntimeConfig>) {
        let node_id = runtime.node_id;

        let controller = self.controller.clone();
        let state = self.state.clone();
        let public_key = self.keys.as_ref().map(|keys| keys.public_key.clone());
        self.tasks.push(periodic::spawn(
            "heartbeat",
            runtime.intervals.heartbeat,
            self.cancel.clone(),
            move || {
                let controller = controller.clone();
                let state = state.clone();
                let public_key = public_key.clone();
                async move {
                    send_heartbeat(controller.as_ref(), &state, node_id, public_key).await?;
                    anyhow::Ok(())
                }
            },
        ));

        let controller = self.controller.clone();
        let engine = self.engine.clone();
        let state = self.state.clone();
        let sync_runtime = runtime.clone();
        self.tasks.push(periodic::spawn(
            "user-sync",
            runtime.intervals.user_sync,
            self.cancel.clone(),
            move || {
                let controller = controller.clone();
                let engine = engine.clone();
                let state = state.clone();
                let runtime = sync_runtime.clone();
                async move {
                    reconcile(controller.as_ref(), engine.as_ref(), &state, &runtime).await?;
                    anyhow::Ok(())
                }
            },
        ));

        let controller = self.controller.clone();
        let engine = self.engine.clone();
        let state = self.state.clone();
        self.tasks.push(periodic::spawn(
            "traffic-report",
            runtime.intervals.traffic_report,
            self.cancel.clone(),
            move || {
                let controller = controller.clone();
                let engine = engine.clone();
                let state = state.clone();
                async move {
                    report_traffic(controller.as_ref(), engine.as_ref(), &state, node_id).await?;
                    anyhow::Ok(())
                }
            },
        ));

        let controller = self.controller.clone();
        let engine = self.engine.clone();
        let state = self.state.clone();
        self.tasks.push(periodic::spawn(
            "activity-report",
            runtime.intervals.activity_report,
            self.cancel.clone(),
            move || {
                let controller = controller.clone();
                let engine = engine.clone();
                let state = state.clone();
                async move {
                    report_activity(controller.as_ref(), engine.as_ref(), &state, node_id).await?;
                    anyhow::Ok(())
                }
            },
        ));

        if let Some(geo) = self.geo.clone() {
            self.tasks.push(periodic::spawn(
                "geo-data",
                geodata::REFRESH_INTERVAL,
                self.cancel.clone(),
                move || {
                    let geo = geo.clone();
                    async move { geo.ensure().await }
                },
            ));
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running | Phase::Starting => {}
            Phase::Created => {
                self.phase = Phase::Stopped;
                return Ok(());
            }
            Phase::Stopping | Phase::Stopped => return Ok(()),
        }
        self.phase = Phase::Stopping;
        tracing::info!("stopping agent");

        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "periodic task ended abnormally");
            }
        }

        if let Err(err) = self.engine.stop().await {
            tracing::error!(error = %err, "failed to stop proxy engine");
        }
        self.phase = Phase::Stopped;
        tracing::info!("agent stopped");
        Ok(())
    }

    /// Starts the agent, waits for `shutdown`, then stops it.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        tracing::info!("shutdown signal received");
        self.stop().await
    }
}

pub async fn build_heartbeat(
    state: &AgentState,
    node_id: u64,
    public_key: Option<String>,
) -> HeartbeatRequest {
    let gauges = host::sample().await;
    HeartbeatRequest {
        node_id,
        status: "online".to_string(),
        current_users: state.current_users().await,
        cpu_usage: gauges.cpu_usage,
        memory_usage: gauges.memory_usage,
        uptime: gauges.uptime_secs,
        timestamp: OffsetDateTime::now_utc(),
        reality_public_key: public_key,
    }
}

async fn send_heartbeat(
    controller: &dyn Controller,
    state: &AgentState,
    node_id: u64,
    public_key: Option<String>,
) -> Result<(), ControlError> {
    let heartbeat = build_heartbeat(state, node_id, public_key).await;
    controller.send_heartbeat(&heartbeat).await?;
    tracing::debug!(
        users = heartbeat.current_users,
        cpu = heartbeat.cpu_usage,
        memory = heartbeat.memory_usage,
        "heartbeat sent"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::fakes::{FakeController, FakeEngine};
    use crate::model::{DesiredIdentity, NodeConfig};
    use crate::resolver::{ConfigSource, TransportSecurity};
    use std::path::Path;
    use std::time::Duration;

    fn config(dir: &Path, extra: &str) -> AgentConfig {
        let raw = format!(
            "node:\n  id: 5\ncontroller:\n  url: http://panel.invalid\nfiles:\n  reality_key: {}\nengine:\n  settle_delay_secs: 0\n  fallback:\n    protocol: vmess\n    listen_port: 8080\n{}",
            dir.join("keys/reality.key").display(),
            extra
        );
        parse_config(&raw).expect("config")
    }

    fn users(ids: &[&str]) -> Vec<DesiredIdentity> {
        ids.iter()
            .map(|id| DesiredIdentity {
                identifier: id.to_string(),
                credential: format!("uuid-{id}"),
                quota_remaining: None,
                active: true,
            })
            .collect()
    }

    #[tokio::test]
    async fn incomplete_reality_config_never_starts_engine() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeController::new());
        controller.set_node_config(NodeConfig {
            port: 443,
            protocol: "vless".into(),
            reality_enabled: true,
            reality_dest: String::new(),
            reality_server_names: "www.example.com".into(),
            reality_short_ids: "ab12".into(),
            ..NodeConfig::default()
        });
        let engine = Arc::new(FakeEngine::new());

        let mut agent = Agent::new(config(dir.path(), ""), controller.clone(), engine.clone());
        let err = agent.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("target destination"));
        assert_eq!(agent.phase(), Phase::Stopped);
        assert!(engine.starts().is_empty());
        assert_eq!(controller.user_fetches(), 0);
    }

    #[tokio::test]
    async fn unreachable_controller_starts_from_local_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeController::unreachable());
        let engine = Arc::new(FakeEngine::new());

        let mut agent = Agent::new(config(dir.path(), ""), controller.clone(), engine.clone());
        agent.start().await.expect("fallback start");
        assert_eq!(agent.phase(), Phase::Running);

        let starts = engine.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].source, ConfigSource::Local);
        assert_eq!(starts[0].listen_port, 8080);
        assert_eq!(starts[0].inbound_tag, "inbound-vless");
        assert_eq!(starts[0].security, TransportSecurity::Plain);
        assert_eq!(controller.user_fetches(), 1);
        assert_eq!(agent.state().current_users().await, 0);

        agent.stop().await.unwrap();
        assert_eq!(agent.phase(), Phase::Stopped);
        assert_eq!(engine.stops(), 1);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn startup_provisions_identities_and_keeps_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeController::new());
        controller.set_node_config(NodeConfig {
            port: 443,
            protocol: "vless".into(),
            inbound_tag: "edge".into(),
            reality_enabled: true,
            reality_dest: "www.example.com:443".into(),
            reality_server_names: "www.example.com".into(),
            reality_short_ids: "ab12".into(),
            ..NodeConfig::default()
        });
        controller.set_users(users(&["a", "b"]));
        let engine = Arc::new(FakeEngine::new());

        let mut agent = Agent::new(config(dir.path(), ""), controller.clone(), engine.clone());
        agent.start().await.unwrap();

        let stored = keys::load_existing(&dir.path().join("keys/reality.key")).expect("key file");
        assert_eq!(agent.public_key(), Some(stored.public_key.as_str()));
        match &engine.starts()[0].security {
            TransportSecurity::Reality(reality) => {
                assert_eq!(reality.private_key, stored.private_key)
            }
            other => panic!("unexpected security {:?}", other),
        }
        assert_eq!(agent.state().current_users().await, 2);
        assert_eq!(engine.identities().len(), 2);

        agent.stop().await.unwrap();
    }

    #[tokio::test]
    async fn engine_start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeController::unreachable());
        let engine = Arc::new(FakeEngine::new());
        engine.fail_start();

        let mut agent = Agent::new(config(dir.path(), ""), controller.clone(), engine.clone());
        let err = agent.start().await.unwrap_err();
        assert!(format!("{:#}", err).contains("failed to start proxy engine"));
        assert_eq!(agent.phase(), Phase::Stopped);
        assert_eq!(controller.user_fetches(), 0);
    }

    #[tokio::test]
    async fn loops_run_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(FakeController::new());
        controller.set_node_config(NodeConfig {
            port: 443,
            protocol: "vless".into(),
            ..NodeConfig::default()
        });
        controller.set_users(users(&["a"]));
        let engine = Arc::new(FakeEngine::new());
        engine.set_counters("a", 10, 20);

        let intervals = "intervals:\n  heartbeat_secs: 3600\n  user_sync_secs: 3600\n  traffic_report_secs: 1\n  activity_report_secs: 3600\n";
        let mut agent = Agent::new(
            config(dir.path(), intervals),
            controller.clone(),
            engine.clone(),
        );
        agent
            .run_until(tokio::time::sleep(Duration::from_millis(1500)))
            .await
            .unwrap();

        let reports = controller.traffic_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].traffic[0].user_email, "a");
        assert_eq!(engine.resets(), vec!["a"]);
        assert_eq!(agent.phase(), Phase::Stopped);
        assert_eq!(engine.stops(), 1);
    }

    #[tokio::test]
    async fn heartbeat_carries_user_count_and_public_key() {
        let state = AgentState::new();
        state
            .provisioned
            .write()
            .await
            .insert("a".into(), users(&["a"]).remove(0));
        let heartbeat = build_heartbeat(&state, 5, Some("pub".into())).await;
        assert_eq!(heartbeat.node_id, 5);
        assert_eq!(heartbeat.status, "online");
        assert_eq!(heartbeat.current_users, 1);
        assert_eq!(heartbeat.reality_public_key.as_deref(), Some("pub"));
        assert!(heartbeat.memory_usage >= 0.0);

        let controller = FakeController::new();
        send_heartbeat(&controller, &state, 5, None).await.unwrap();
        let sent = controller.heartbeats();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].reality_public_key, None);
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::new());
        let mut agent = Agent::new(
            config(dir.path(), ""),
            Arc::new(FakeController::unreachable()),
            engine.clone(),
        );
        agent.stop().await.unwrap();
        assert_eq!(agent.phase(), Phase::Stopped);
        assert_eq!(engine.stops(), 0);
        assert!(agent.start().await.is_err());
    }
}
