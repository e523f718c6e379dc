use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{AgentState, ExecutionStatus, Plan, PlanMetadata, PlanState, StreamKind};

/// Closed set of events the coordinator and supervisor publish. Each variant
/// serialises to one bridge → client message with `type` set to the variant's
/// kebab-case name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BridgeEvent {
    #[serde(rename = "agent-plan", rename_all = "camelCase")]
    AgentPlan {
        id: String,
        prompt: String,
        plan: String,
        modified_files: Vec<String>,
        metadata: PlanMetadata,
        approved: bool,
    },
    #[serde(rename_all = "camelCase")]
    PlanApproved { plan_id: String },
    #[serde(rename_all = "camelCase")]
    PlanRejected { plan_id: String, reason: String },
    #[serde(rename = "agent-output", rename_all = "camelCase")]
    AgentOutput {
        execution_id: String,
        stream: StreamKind,
        data: String,
        ts: DateTime<Utc>,
    },
    #[serde(rename = "agent-state-change", rename_all = "camelCase")]
    AgentStateChange {
        execution_id: String,
        state: AgentState,
    },
    #[serde(rename_all = "camelCase")]
    ExecutionStarted {
        execution_id: String,
        plan_id: String,
    },
    #[serde(rename = "execution-progress", rename_all = "camelCase")]
    ExecutionProgress {
        execution_id: String,
        status: ExecutionStatus,
        progress: u8,
    },
    #[serde(rename_all = "camelCase")]
    FileChanged {
        execution_id: String,
        file: String,
    },
    #[serde(rename_all = "camelCase")]
    FileList {
        files: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        execution_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    FileDiff {
        execution_id: String,
        file: String,
        diff: String,
    },
    #[serde(rename = "execution-complete", rename_all = "camelCase")]
    ExecutionComplete {
        execution_id: String,
        plan_id: String,
        modified_files: Vec<String>,
        result: String,
    },
    #[serde(rename = "execution-failed", rename_all = "camelCase")]
    ExecutionFailed {
        execution_id: String,
        error: String,
        code: crate::ErrorCode,
    },
    #[serde(rename_all = "camelCase")]
    WorktreeCreated {
        path: String,
        branch: String,
        base_branch: String,
    },
    #[serde(rename_all = "camelCase")]
    WorktreeDeleted { path: String, branch: String },
    #[serde(rename = "pr-created", rename_all = "camelCase")]
    PrCreated {
        execution_id: String,
        url: String,
        branch: String,
    },
    #[serde(rename_all = "camelCase")]
    EmergencyKillConfirmed {
        aborted_executions: Vec<String>,
        terminated_sessions: Vec<String>,
    },
}

impl BridgeEvent {
    pub fn plan_proposed(plan: &Plan) -> Self {
        Self::AgentPlan {
            id: plan.id.clone(),
            prompt: plan.prompt.clone(),
            plan: plan.plan_text.clone(),
            modified_files: plan.modified_files_hint.clone(),
            metadata: plan.metadata.clone(),
            approved: plan.state == PlanState::Approved,
        }
    }
}

/// Bus frame: every event is addressed to the session that owns it, so each
/// connection task can filter the broadcast stream down to its own traffic.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session_id: String,
    pub event: BridgeEvent,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, event: BridgeEvent) -> Self {
        Self {
            session_id: session_id.into(),
            event,
        }
    }

    pub fn to_wire(&self) -> Value {
        serde_json::to_value(&self.event).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{AgentKind, PlanComplexity};

    #[test]
    fn agent_plan_event_carries_the_wire_shape() {
        let plan = Plan {
            id: "pl-1".into(),
            session_id: "s-1".into(),
            prompt: "add a test".into(),
            workdir: "/tmp/repo".into(),
            agent_kind: AgentKind::ClaudeCode,
            plan_text: "1. add test".into(),
            modified_files_hint: vec!["src/lib.rs".into()],
            state: PlanState::Proposed,
            metadata: PlanMetadata {
                complexity: PlanComplexity::Low,
                risk_level: PlanComplexity::Low,
                estimated_duration: "2m".into(),
            },
            created_at: Utc::now(),
            approved_at: None,
            rejected_at: None,
            executed_at: None,
            rejection_reason: None,
        };
        let value = serde_json::to_value(BridgeEvent::plan_proposed(&plan)).expect("serialize");
        assert_eq!(value["type"], "agent-plan");
        assert_eq!(value["id"], "pl-1");
        assert_eq!(value["plan"], "1. add test");
        assert_eq!(value["modifiedFiles"][0], "src/lib.rs");
        assert_eq!(value["approved"], false);
        assert_eq!(value["metadata"]["estimatedDuration"], "2m");
    }

    #[test]
    fn events_serialize_with_kebab_case_type_tag() {
        let event = BridgeEvent::ExecutionProgress {
            execution_id: "e-1".into(),
            status: ExecutionStatus::Running,
            progress: 80,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "execution-progress");
        assert_eq!(value["executionId"], "e-1");
        assert_eq!(value["status"], "RUNNING");
        assert_eq!(value["progress"], 80);
    }

    #[test]
    fn output_event_carries_stream_tag_and_timestamp() {
        let event = BridgeEvent::AgentOutput {
            execution_id: "e-2".into(),
            stream: StreamKind::Stderr,
            data: "warning: unused import\n".into(),
            ts: Utc::now(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "agent-output");
        assert_eq!(value["stream"], "stderr");
        assert!(value["ts"].is_string());
    }

    #[test]
    fn emergency_confirmation_lists_are_plain_arrays() {
        let event = BridgeEvent::EmergencyKillConfirmed {
            aborted_executions: vec!["e-1".into()],
            terminated_sessions: vec![],
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "emergency-kill-confirmed");
        assert_eq!(value["abortedExecutions"][0], "e-1");
        assert_eq!(value["terminatedSessions"].as_array().map(Vec::len), Some(0));
    }
}
