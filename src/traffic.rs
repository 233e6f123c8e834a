use crate::control::{ControlError, Controller};
use crate::engine::ProxyEngine;
use crate::model::{TrafficReportRequest, UserTrafficReport};
use crate::state::AgentState;
use time::OffsetDateTime;

/// Collects per-identity byte counts since the previous report and resets
/// the engine counters for every identity that had traffic.
pub async fn collect_traffic(engine: &dyn ProxyEngine, state: &AgentState) -> Vec<UserTrafficReport> {
    let identifiers = state.identifiers().await;
    let mut traffic = Vec::new();
    for identifier in identifiers {
        let counters = match engine.get_counters(&identifier).await {
            Ok(counters) => counters,
            Err(err) => {
                tracing::warn!(identity = %identifier, error = %err, "failed to read traffic counters");
                continue;
            }
        };
        if counters.is_zero() {
            continue;
        }
        if let Err(err) = engine.reset_counters(&identifier).await {
            tracing::warn!(identity = %identifier, error = %err, "failed to reset traffic counters");
        }
        traffic.push(UserTrafficReport {
            user_email: identifier,
            upload_bytes: counters.upload_bytes,
            download_bytes: counters.download_bytes,
        });
    }
    traffic
}

pub async fn report_traffic(
    controller: &dyn Controller,
    engine: &dyn ProxyEngine,
    state: &AgentState,
    node_id: u64,
) -> Result<usize, ControlError> {
    let traffic = collect_traffic(engine, state).await;
    if traffic.is_empty() {
        return Ok(0);
    }
    let reported = traffic.len();
    controller
        .send_traffic_report(&TrafficReportRequest {
            node_id,
            traffic,
            timestamp: OffsetDateTime::now_utc(),
        })
        .await?;
    tracing::debug!(identities = reported, "traffic report sent");
    Ok(reported)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeController, FakeEngine};
    use crate::model::DesiredIdentity;

    async fn state_with(ids: &[&str]) -> AgentState {
        let state = AgentState::new();
        {
            let mut provisioned = state.provisioned.write().await;
            for id in ids {
                provisioned.insert(
                    id.to_string(),
                    DesiredIdentity {
                        identifier: id.to_string(),
                        credential: String::new(),
                        quota_remaining: None,
                        active: true,
                    },
                );
            }
        }
        state
    }

    #[tokio::test]
    async fn reports_and_resets_only_identities_with_traffic() {
        let controller = FakeController::new();
        let engine = FakeEngine::new();
        let state = state_with(&["a", "b", "c"]).await;
        engine.set_counters("a", 100, 2_000);
        engine.set_counters("c", 0, 7);

        let reported = report_traffic(&controller, &engine, &state, 9).await.unwrap();
        assert_eq!(reported, 2);
        assert_eq!(engine.resets(), vec!["a", "c"]);

        let reports = controller.traffic_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].node_id, 9);
        assert_eq!(
            reports[0].traffic,
            vec![
                UserTrafficReport {
                    user_email: "a".into(),
                    upload_bytes: 100,
                    download_bytes: 2_000,
                },
                UserTrafficReport {
                    user_email: "c".into(),
                    upload_bytes: 0,
                    download_bytes: 7,
                },
            ]
        );
    }

    #[tokio::test]
    async fn idle_node_sends_nothing() {
        let controller = FakeController::new();
        let engine = FakeEngine::new();
        let state = state_with(&["a"]).await;
        engine.fail_counters("a");

        assert_eq!(report_traffic(&controller, &engine, &state, 9).await.unwrap(), 0);
        assert!(controller.traffic_reports().is_empty());
        assert!(engine.resets().is_empty());
    }
}
