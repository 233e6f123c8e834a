//! Counter-delta liveness detection.
//!
//! The engine only exposes cumulative byte counters, so an identity is
//! considered active when either counter grew since the previous sample. The
//! first sample of an identity is a baseline and never counts as activity.

use crate::control::{ControlError, Controller};
use crate::engine::{ProxyEngine, TrafficCounters};
use crate::model::{ActivityReportRequest, UserActivityReport};
use crate::state::AgentState;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;

/// How long an identity stays online after its last observed traffic.
pub const LIVENESS_WINDOW: time::Duration = time::Duration::minutes(2);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActivityRecord {
    pub identifier: String,
    pub last_seen: Option<OffsetDateTime>,
    pub last_uplink: u64,
    pub last_downlink: u64,
    pub active_this_tick: bool,
}

impl ActivityRecord {
    pub fn is_online(&self, now: OffsetDateTime) -> bool {
        if self.active_this_tick {
            return true;
        }
        match self.last_seen {
            Some(seen) => now - seen < LIVENESS_WINDOW,
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ActivityTracker {
    records: HashMap<String, ActivityRecord>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one counter sample and returns whether it showed new traffic.
    pub fn observe(
        &mut self,
        identifier: &str,
        counters: TrafficCounters,
        now: OffsetDateTime,
    ) -> bool {
        let Some(record) = self.records.get_mut(identifier) else {
            self.records.insert(
                identifier.to_string(),
                ActivityRecord {
                    identifier: identifier.to_string(),
                    last_seen: None,
                    last_uplink: counters.upload_bytes,
                    last_downlink: counters.download_bytes,
                    active_this_tick: false,
                },
            );
            return false;
        };

        // A counter that went backwards was reset elsewhere; the new value is
        // just the next baseline.
        let active = counters.upload_bytes > record.last_uplink
            || counters.download_bytes > record.last_downlink;
        if active {
            tracing::debug!(
                identity = identifier,
                uplink = counters.upload_bytes.saturating_sub(record.last_uplink),
                downlink = counters.download_bytes.saturating_sub(record.last_downlink),
                "identity active"
            );
            record.last_seen = Some(now);
        }
        record.active_this_tick = active;
        record.last_uplink = counters.upload_bytes;
        record.last_downlink = counters.download_bytes;
        active
    }

    pub fn get(&self, identifier: &str) -> Option<&ActivityRecord> {
        self.records.get(identifier)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drops records for identities that are no longer provisioned.
    pub fn retain_provisioned(&mut self, provisioned: &HashSet<String>) {
        self.records
            .retain(|identifier, _| provisioned.contains(identifier));
    }

    /// Records that have shown traffic at least once, sorted by identifier,
    /// with their online flag as of `now`.
    pub fn reportable(&self, now: OffsetDateTime) -> Vec<(ActivityRecord, bool)> {
        let mut records: Vec<(ActivityRecord, bool)> = self
            .records
            .values()
            .filter(|record| record.last_seen.is_some())
            .map(|record| (record.clone(), record.is_online(now)))
            .collect();
        records.sort_by(|a, b| a.0.identifier.cmp(&b.0.identifier));
        records
    }
}

/// One activity tick: sample counters, update the tracker, and report every
/// identity seen so far. Returns the number of identities reported.
pub async fn report_activity(
    controller: &dyn Controller,
    engine: &dyn ProxyEngine,
    state: &AgentState,
    node_id: u64,
) -> Result<usize, ControlError> {
    let identifiers = state.identifiers().await;

    let mut samples = Vec::with_capacity(identifiers.len());
    for identifier in &identifiers {
        match engine.get_counters(identifier).await {
            Ok(counters) => samples.push((identifier.as_str(), counters)),
            Err(err) => {
                tracing::debug!(identity = %identifier, error = %err, "failed to sample counters");
            }
        }
    }

    let now = OffsetDateTime::now_utc();
    let (reportable, active) = {
        let mut tracker = state.activity.lock().await;
        let mut active = 0;
        for (identifier, counters) in &samples {
            if tracker.observe(identifier, *counters, now) {
                active += 1;
            }
        }
        let reportable = tracker.reportable(now);
        let provisioned: HashSet<String> = state.identifiers().await.into_iter().collect();
        tracker.retain_provisioned(&provisioned);
        (reportable, active)
    };

    let mut users = Vec::with_capacity(reportable.len());
    for (record, is_online) in reportable {
        let mut report = UserActivityReport {
            email: record.identifier.clone(),
            last_seen: record.last_seen.unwrap_or(now),
            is_online,
            device_count: 0,
            device_ips: Vec::new(),
        };
        if is_online {
            match engine.online_peers(&record.identifier).await {
                Ok(peers) => {
                    report.device_count = peers.len();
                    report.device_ips = peers.into_iter().collect();
                }
                Err(err) => {
                    tracing::debug!(identity = %record.identifier, error = %err, "failed to query online peers");
                }
            }
        }
        users.push(report);
    }

    if users.is_empty() {
        return Ok(0);
    }
    let reported = users.len();
    controller
        .send_activity_report(&ActivityReportRequest {
            node_id,
            users,
            timestamp: now,
        })
        .await?;
    if active > 0 {
        tracing::info!(active, tracked = reported, "activity report sent");
    }
    Ok(reported)
}
