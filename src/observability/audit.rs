/// Structured bootstrap audit trail
///
/// Every stage transition of a bootstrap run produces one JSON record on
/// the `runk::audit` log target. Records of one run share a run id.
use chrono::{SecondsFormat, Utc};
use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const AUDIT_TARGET: &str = "runk::audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    Completed,
    Failed,
}

/// Identifiers tying records of one run together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrelationIds {
    pub run_id: String,
    pub container_id: String,
}

impl CorrelationIds {
    pub fn new(container_id: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            container_id: container_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapEvent {
    pub timestamp: String,
    pub run_id: String,
    pub container_id: String,
    pub stage: String,
    pub outcome: StageOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BootstrapEvent {
    pub fn new(correlation: &CorrelationIds, stage: impl ToString, outcome: StageOutcome) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            run_id: correlation.run_id.clone(),
            container_id: correlation.container_id.clone(),
            stage: stage.to_string(),
            outcome,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"run_id":"{}","error":"unserialisable event: {}"}}"#, self.run_id, e)
        })
    }
}

/// Audit sink for one bootstrap run.
#[derive(Debug, Clone)]
pub struct AuditLog {
    correlation: CorrelationIds,
}

impl AuditLog {
    pub fn new(container_id: &str) -> Self {
        Self {
            correlation: CorrelationIds::new(container_id),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.correlation.run_id
    }

    pub fn correlation(&self) -> &CorrelationIds {
        &self.correlation
    }

    pub fn completed(&self, stage: impl ToString, detail: Option<String>) -> BootstrapEvent {
        let mut event = BootstrapEvent::new(&self.correlation, stage, StageOutcome::Completed);
        event.detail = detail;
        self.record(&event);
        event
    }

    pub fn failed(&self, stage: impl ToString, cause: &dyn std::fmt::Display) -> BootstrapEvent {
        let event = BootstrapEvent::new(&self.correlation, stage, StageOutcome::Failed)
            .with_detail(cause.to_string());
        self.record(&event);
        event
    }

    fn record(&self, event: &BootstrapEvent) {
        match event.outcome {
            StageOutcome::Completed => info!(target: AUDIT_TARGET, "{}", event.to_json()),
            StageOutcome::Failed => error!(target: AUDIT_TARGET, "{}", event.to_json()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let log = AuditLog::new("runk");
        let event = log.completed("platform", Some("ptrace".to_string()));

        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["stage"], "platform");
        assert_eq!(value["outcome"], "completed");
        assert_eq!(value["detail"], "ptrace");
        assert_eq!(value["container_id"], "runk");
        assert_eq!(value["run_id"], log.run_id());
        assert!(chrono::DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_failed_event_carries_cause() {
        let log = AuditLog::new("runk");
        let event = log.failed("network", &"no interfaces");
        assert_eq!(event.outcome, StageOutcome::Failed);
        assert_eq!(event.detail.as_deref(), Some("no interfaces"));
    }

    #[test]
    fn test_detail_omitted_when_absent() {
        let log = AuditLog::new("runk");
        let json = log.completed("start", None).to_json();
        assert!(!json.contains("detail"));
    }

    #[test]
    fn test_run_ids_are_unique() {
        assert_ne!(AuditLog::new("a").run_id(), AuditLog::new("a").run_id());
    }
}
