use crate::activity::ActivityTracker;
use crate::model::DesiredIdentity;
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};

/// Identities currently pushed into the proxy engine, keyed by identifier.
pub type ProvisionedSet = HashMap<String, DesiredIdentity>;

/// State shared between the periodic loops.
///
/// The provisioned set is only written by the reconciler. Every other loop
/// takes a snapshot of the identifiers and releases the lock before talking
/// to the engine.
#[derive(Default)]
pub struct AgentState {
    pub provisioned: RwLock<ProvisionedSet>,
    pub activity: Mutex<ActivityTracker>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn identifiers(&self) -> Vec<String> {
        let provisioned = self.provisioned.read().await;
        let mut identifiers: Vec<String> = provisioned.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    pub async fn current_users(&self) -> usize {
        self.provisioned.read().await.len()
    }
}
