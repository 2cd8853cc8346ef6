//! Control-plane wire types.
//!
//! Commands and replies are JSON with PascalCase field names, matching the
//! existing protocol bit-for-bit. Unknown fields are ignored on receive so
//! older agents tolerate newer control planes.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A command received from the control plane.
///
/// Immutable once received; the routing fields (`id`, `user`) are echoed
/// verbatim into the reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Cmd {
    pub id: u64,
    pub ts: Option<DateTime<Utc>>,
    pub user: String,
    pub agent_uuid: String,
    /// Target service tag ("qan", "mm", "data"), or empty for the agent.
    pub service: String,
    /// The verb: "Status", "StartService", "StopService", "GetConfig", "Stop".
    pub cmd: String,
    /// Verb-specific payload; for service verbs a nested [`ServiceData`].
    pub data: Option<Value>,
}

impl Cmd {
    /// Builds a successful reply carrying `data`, echoing this command's
    /// routing.
    pub fn reply_ok(&self, data: Value) -> Reply {
        Reply {
            id: self.id,
            cmd: self.cmd.clone(),
            error: String::new(),
            data,
        }
    }

    /// Builds an error reply, echoing this command's routing.
    pub fn reply_err(&self, err: impl fmt::Display) -> Reply {
        Reply {
            id: self.id,
            cmd: self.cmd.clone(),
            error: err.to_string(),
            data: Value::Null,
        }
    }

    /// Decodes the nested [`ServiceData`] payload of a service verb.
    pub fn service_data(&self) -> Result<ServiceData, serde_json::Error> {
        let data = self.data.clone().unwrap_or(Value::Null);
        serde_json::from_value(data)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cmd[Id:{} Cmd:{} Service:{} User:{}]",
            self.id, self.cmd, self.service, self.user
        )
    }
}

/// A reply sent back to the control plane. Empty `error` means success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Reply {
    pub id: u64,
    pub cmd: String,
    pub error: String,
    pub data: Value,
}

/// Nested payload of `StartService` / `StopService` commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceData {
    pub name: String,
    pub config: Value,
}

/// Identifies the monitored database instance a service is bound to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ServiceInstance {
    pub service: String,
    pub instance_id: u32,
}

/// The `Data` payload of a `Status` reply.
///
/// Fixed fields cover the agent and the built-in services; transient
/// entries (per-worker, per-monitor) are flattened alongside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct StatusReport {
    pub agent: String,
    pub agent_cmd_handler: String,
    pub agent_cmd_queue: Vec<String>,
    pub qan: String,
    pub qan_log_parser: String,
    pub mm: String,
    pub data: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_wire_field_names_are_pascal_case() {
        let cmd = Cmd {
            id: 7,
            ts: None,
            user: "ops".into(),
            agent_uuid: "abc-123".into(),
            service: "qan".into(),
            cmd: "StartService".into(),
            data: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["Id"], 7);
        assert_eq!(json["User"], "ops");
        assert_eq!(json["AgentUuid"], "abc-123");
        assert_eq!(json["Service"], "qan");
        assert_eq!(json["Cmd"], "StartService");
    }

    #[test]
    fn cmd_ignores_unknown_fields_and_defaults_missing() {
        let cmd: Cmd =
            serde_json::from_str(r#"{"Cmd":"Status","Wat":true,"Nested":{"A":1}}"#).unwrap();
        assert_eq!(cmd.cmd, "Status");
        assert_eq!(cmd.id, 0);
        assert_eq!(cmd.user, "");
        assert!(cmd.data.is_none());
    }

    #[test]
    fn reply_echoes_routing() {
        let cmd = Cmd {
            id: 9,
            cmd: "StopService".into(),
            ..Cmd::default()
        };
        let ok = cmd.reply_ok(Value::Null);
        assert_eq!(ok.id, 9);
        assert_eq!(ok.cmd, "StopService");
        assert_eq!(ok.error, "");

        let err = cmd.reply_err("boom");
        assert_eq!(err.id, 9);
        assert_eq!(err.error, "boom");
    }

    #[test]
    fn service_data_round_trip() {
        let sd = ServiceData {
            name: "qan".into(),
            config: serde_json::json!({"Interval": 60}),
        };
        let cmd = Cmd {
            cmd: "StartService".into(),
            data: Some(serde_json::to_value(&sd).unwrap()),
            ..Cmd::default()
        };
        let got = cmd.service_data().unwrap();
        assert_eq!(got.name, "qan");
        assert_eq!(got.config["Interval"], 60);
    }

    #[test]
    fn status_report_shape() {
        let report = StatusReport {
            agent: "Ready".into(),
            agent_cmd_handler: "Ready".into(),
            ..StatusReport::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["Agent"], "Ready");
        assert_eq!(json["AgentCmdHandler"], "Ready");
        assert_eq!(json["AgentCmdQueue"], serde_json::json!([]));
        assert_eq!(json["Qan"], "");
        assert_eq!(json["Mm"], "");
    }

    #[test]
    fn status_report_flattens_worker_entries() {
        let mut report = StatusReport::default();
        report
            .extra
            .insert("qan-worker-1".into(), "Parsing slow.log".into());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["qan-worker-1"], "Parsing slow.log");

        let back: StatusReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.extra["qan-worker-1"], "Parsing slow.log");
    }

    #[test]
    fn cmd_display_is_queue_friendly() {
        let cmd = Cmd {
            id: 3,
            user: "ops".into(),
            cmd: "StartService".into(),
            ..Cmd::default()
        };
        assert_eq!(cmd.to_string(), "Cmd[Id:3 Cmd:StartService Service: User:ops]");
    }
}
