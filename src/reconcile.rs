use crate::control::{ControlError, Controller};
use crate::engine::{IdentitySpec, ProxyEngine};
use crate::model::DesiredIdentity;
use crate::resolver::ResolvedRuntimeConfig;
use crate::state::AgentState;
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub removed: usize,
    pub failed: usize,
    pub total: usize,
}

impl SyncSummary {
    pub fn changed(&self) -> bool {
        self.added > 0 || self.removed > 0
    }
}

/// One reconciliation pass: fetch the desired identities and converge the
/// engine and the provisioned set towards them.
///
/// A failed fetch leaves the provisioned set untouched. A failed engine call
/// only skips that identity; it is retried on the next pass because the set
/// still disagrees with the controller.
pub async fn reconcile(
    controller: &dyn Controller,
    engine: &dyn ProxyEngine,
    state: &AgentState,
    runtime: &ResolvedRuntimeConfig,
) -> Result<SyncSummary, ControlError> {
    let fetched = controller.fetch_desired_users(runtime.node_id).await?;
    let desired: BTreeMap<String, DesiredIdentity> = fetched
        .into_iter()
        .filter(|identity| identity.active && !identity.identifier.is_empty())
        .map(|identity| (identity.identifier.clone(), identity))
        .collect();

    let mut provisioned = state.provisioned.write().await;
    let mut summary = SyncSummary::default();

    for (identifier, identity) in &desired {
        if provisioned.contains_key(identifier) {
            continue;
        }
        let spec = IdentitySpec::for_runtime(identifier, &identity.credential, runtime);
        match engine.add_identity(&spec).await {
            Ok(()) => {
                provisioned.insert(identifier.clone(), identity.clone());
                summary.added += 1;
            }
            Err(err) => {
                tracing::error!(identity = %identifier, error = %err, "failed to add identity");
                summary.failed += 1;
            }
        }
    }

    let stale: Vec<String> = provisioned
        .keys()
        .filter(|identifier| !desired.contains_key(*identifier))
        .cloned()
        .collect();
    for identifier in stale {
        match engine.remove_identity(&identifier).await {
            Ok(()) => {
                provisioned.remove(&identifier);
                summary.removed += 1;
            }
            Err(err) => {
                tracing::error!(identity = %identifier, error = %err, "failed to remove identity");
                summary.failed += 1;
            }
        }
    }

    summary.total = provisioned.len();
    if summary.changed() {
        tracing::info!(
            total = summary.total,
            added = summary.added,
            removed = summary.removed,
            failed = summary.failed,
            "identity sync applied changes"
        );
    } else {
        tracing::info!(total = summary.total, failed = summary.failed, "identity sync complete");
    }
    Ok(summary)
}
