use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Envelope every controller response is wrapped in.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfigData {
    pub node: NodeConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub tls_enabled: bool,
    #[serde(default)]
    pub sni: String,
    #[serde(default)]
    pub inbound_tag: String,
    #[serde(default)]
    pub api_endpoint: String,
    #[serde(default)]
    pub api_port: u16,
    #[serde(default)]
    pub reality_enabled: bool,
    #[serde(default)]
    pub reality_dest: String,
    #[serde(default)]
    pub reality_server_names: String,
    #[serde(default)]
    pub reality_private_key: String,
    #[serde(default)]
    pub reality_public_key: String,
    #[serde(default)]
    pub reality_short_ids: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct UserSyncData {
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

/// One user row of the sync response, as the controller sends it.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct UserConfig {
    #[serde(default)]
    pub user_id: u64,
    pub email: String,
    pub uuid: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, rename = "data_limit_bytes")]
    pub data_limit: i64,
    #[serde(default, rename = "data_used_bytes")]
    pub data_used: i64,
}

/// An identity the controller wants provisioned on this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DesiredIdentity {
    pub identifier: String,
    pub credential: String,
    /// `None` when the plan has no data limit.
    pub quota_remaining: Option<u64>,
    pub active: bool,
}

impl From<UserConfig> for DesiredIdentity {
    fn from(user: UserConfig) -> Self {
        let quota_remaining = if user.data_limit > 0 {
            Some(user.data_limit.saturating_sub(user.data_used).max(0) as u64)
        } else {
            None
        };
        let active = user.status.is_empty() || user.status.eq_ignore_ascii_case("active");
        Self {
            identifier: user.email,
            credential: user.uuid,
            quota_remaining,
            active,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_id: u64,
    pub status: String,
    pub current_users: usize,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub uptime: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality_public_key: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrafficReportRequest {
    pub node_id: u64,
    pub traffic: Vec<UserTrafficReport>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserTrafficReport {
    pub user_email: String,
    pub upload_bytes: u64,
    pub download_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityReportRequest {
    pub node_id: u64,
    pub users: Vec<UserActivityReport>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserActivityReport {
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub is_online: bool,
    pub device_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_data_is_optional() {
        let ok: Envelope<NodeConfigData> = serde_json::from_str(
            r#"{"success":true,"data":{"node":{"id":7,"port":443,"protocol":"vless"}}}"#,
        )
        .unwrap();
        let node = ok.data.expect("data").node;
        assert_eq!(node.id, 7);
        assert_eq!(node.port, 443);

        let failed: Envelope<NodeConfigData> =
            serde_json::from_str(r#"{"success":false,"error":"node not found"}"#).unwrap();
        assert!(failed.data.is_none());
        assert_eq!(failed.error.as_deref(), Some("node not found"));
    }

    #[test]
    fn user_config_maps_to_desired_identity() {
        let user: UserConfig = serde_json::from_str(
            r#"{"user_id":3,"email":"a@example.com","uuid":"u-1","status":"active","data_limit_bytes":1000,"data_used_bytes":250}"#,
        )
        .unwrap();
        let desired = DesiredIdentity::from(user);
        assert_eq!(desired.identifier, "a@example.com");
        assert_eq!(desired.credential, "u-1");
        assert_eq!(desired.quota_remaining, Some(750));
        assert!(desired.active);
    }

    #[test]
    fn unlimited_and_suspended_users() {
        let unlimited = DesiredIdentity::from(UserConfig {
            email: "b@example.com".into(),
            uuid: "u-2".into(),
            ..UserConfig::default()
        });
        assert_eq!(unlimited.quota_remaining, None);
        assert!(unlimited.active);

        let suspended = DesiredIdentity::from(UserConfig {
            email: "c@example.com".into(),
            uuid: "u-3".into(),
            status: "suspended".into(),
            data_limit: 10,
            data_used: 40,
            ..UserConfig::default()
        });
        assert_eq!(suspended.quota_remaining, Some(0));
        assert!(!suspended.active);
    }

    #[test]
    fn activity_report_omits_empty_device_list() {
        let report = UserActivityReport {
            email: "a@example.com".into(),
            last_seen: time::macros::datetime!(2026-01-02 03:04:05 UTC),
            is_online: false,
            device_count: 0,
            device_ips: Vec::new(),
        };
        let json = serde_json::to_value(&report).unwrap();
        assert!(json.get("device_ips").is_none());
        assert_eq!(json["last_seen"], "2026-01-02T03:04:05Z");
    }
}
