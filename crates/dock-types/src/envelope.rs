use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One signed command as it appears on the message channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl CommandEnvelope {
    pub fn data_or_empty(&self) -> Value {
        self.data.clone().unwrap_or_else(|| Value::Object(Default::default()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Pair,
    Authenticate,
    InitSession,
    StartAgentSession,
    CreateWorktree,
    GitStatus,
    GitCommand,
    ExecutePrompt,
    ApprovePlan,
    RejectPlan,
    AbortExecution,
    AgentInteraction,
    AgentFeedback,
    GeneratePr,
    CleanupWorktree,
    HealthCheck,
    EmergencyKill,
}

impl CommandKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pair" => Self::Pair,
            "authenticate" => Self::Authenticate,
            "init-session" => Self::InitSession,
            "start-agent-session" => Self::StartAgentSession,
            "create-worktree" => Self::CreateWorktree,
            "git-status" => Self::GitStatus,
            "git-command" => Self::GitCommand,
            "execute-prompt" => Self::ExecutePrompt,
            "approve-plan" => Self::ApprovePlan,
            "reject-plan" => Self::RejectPlan,
            "abort-execution" => Self::AbortExecution,
            "agent-interaction" => Self::AgentInteraction,
            "agent-feedback" => Self::AgentFeedback,
            "generate-pr" => Self::GeneratePr,
            "cleanup-worktree" => Self::CleanupWorktree,
            "health-check" => Self::HealthCheck,
            "emergency-kill" => Self::EmergencyKill,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pair => "pair",
            Self::Authenticate => "authenticate",
            Self::InitSession => "init-session",
            Self::StartAgentSession => "start-agent-session",
            Self::CreateWorktree => "create-worktree",
            Self::GitStatus => "git-status",
            Self::GitCommand => "git-command",
            Self::ExecutePrompt => "execute-prompt",
            Self::ApprovePlan => "approve-plan",
            Self::RejectPlan => "reject-plan",
            Self::AbortExecution => "abort-execution",
            Self::AgentInteraction => "agent-interaction",
            Self::AgentFeedback => "agent-feedback",
            Self::GeneratePr => "generate-pr",
            Self::CleanupWorktree => "cleanup-worktree",
            Self::HealthCheck => "health-check",
            Self::EmergencyKill => "emergency-kill",
        }
    }

    /// Every command is signed except the liveness probe.
    pub fn requires_signature(&self) -> bool {
        !matches!(self, Self::HealthCheck)
    }

    /// Commands that may only run inside an authenticated session.
    pub fn requires_session(&self) -> bool {
        !matches!(self, Self::Pair | Self::Authenticate | Self::HealthCheck)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_name() {
        for kind in [
            CommandKind::Pair,
            CommandKind::Authenticate,
            CommandKind::InitSession,
            CommandKind::StartAgentSession,
            CommandKind::CreateWorktree,
            CommandKind::GitStatus,
            CommandKind::GitCommand,
            CommandKind::ExecutePrompt,
            CommandKind::ApprovePlan,
            CommandKind::RejectPlan,
            CommandKind::AbortExecution,
            CommandKind::AgentInteraction,
            CommandKind::AgentFeedback,
            CommandKind::GeneratePr,
            CommandKind::CleanupWorktree,
            CommandKind::HealthCheck,
            CommandKind::EmergencyKill,
        ] {
            assert_eq!(CommandKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(CommandKind::parse("not-a-command"), None);
    }

    #[test]
    fn only_health_check_is_unsigned() {
        assert!(!CommandKind::HealthCheck.requires_signature());
        assert!(CommandKind::Pair.requires_signature());
        assert!(CommandKind::GitStatus.requires_signature());
    }

    #[test]
    fn session_exemptions_cover_handshake_commands() {
        assert!(!CommandKind::Pair.requires_session());
        assert!(!CommandKind::Authenticate.requires_session());
        assert!(!CommandKind::HealthCheck.requires_session());
        assert!(CommandKind::ExecutePrompt.requires_session());
    }

    #[test]
    fn envelope_deserializes_with_optional_fields_absent() {
        let raw = r#"{"id":"m-1","type":"health-check","timestamp":"2026-08-01T12:00:00Z"}"#;
        let envelope: CommandEnvelope = serde_json::from_str(raw).expect("parse");
        assert_eq!(envelope.kind, "health-check");
        assert!(envelope.data.is_none());
        assert!(envelope.signature.is_none());
        assert!(envelope.data_or_empty().is_object());
    }
}
