use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    ClaudeCode,
    Codex,
    Gemini,
}

impl AgentKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "claude-code" => Self::ClaudeCode,
            "codex" => Self::Codex,
            "gemini" => Self::Gemini,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    /// Binary name probed on PATH when no explicit path is configured.
    pub fn binary_name(&self) -> &'static str {
        match self {
            Self::ClaudeCode => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanState {
    Proposed,
    Approved,
    Rejected,
    Executed,
    Expired,
}

impl PlanState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanComplexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub complexity: PlanComplexity,
    pub risk_level: PlanComplexity,
    pub estimated_duration: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: String,
    pub session_id: String,
    pub prompt: String,
    pub workdir: String,
    pub agent_kind: AgentKind,
    pub plan_text: String,
    pub modified_files_hint: Vec<String>,
    pub state: PlanState,
    pub metadata: PlanMetadata,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Queued,
    Starting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// At most one execution per session may hold one of these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: String,
    pub plan_id: String,
    pub session_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub progress_percent: u8,
    pub modified_files: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Planning,
    AwaitingApproval,
    Executing,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_kind_parses_wire_names() {
        assert_eq!(AgentKind::parse("claude-code"), Some(AgentKind::ClaudeCode));
        assert_eq!(AgentKind::parse("codex"), Some(AgentKind::Codex));
        assert_eq!(AgentKind::parse("vim"), None);
    }

    #[test]
    fn plan_states_classify_terminal() {
        assert!(!PlanState::Proposed.is_terminal());
        assert!(!PlanState::Approved.is_terminal());
        assert!(PlanState::Rejected.is_terminal());
        assert!(PlanState::Executed.is_terminal());
        assert!(PlanState::Expired.is_terminal());
    }

    #[test]
    fn execution_states_classify_active_and_terminal() {
        assert!(ExecutionStatus::Starting.is_active());
        assert!(ExecutionStatus::Running.is_active());
        assert!(!ExecutionStatus::Queued.is_active());
        assert!(ExecutionStatus::Aborted.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn plan_serializes_camel_case() {
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
        let value = serde_json::to_value(&plan).expect("serialize");
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["state"], "PROPOSED");
        assert_eq!(value["agentKind"], "claude-code");
        assert_eq!(value["metadata"]["riskLevel"], "low");
    }
}
