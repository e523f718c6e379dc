use serde::{Deserialize, Serialize};

/// Short wire codes for every fault the bridge reports to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessageFormat,
    MissingSignature,
    InvalidSignature,
    NotAuthenticated,
    SessionExpired,
    RateLimitExceeded,
    ReplayDetected,
    CommandExpired,
    CommandFromFuture,
    OriginNotAllowed,
    PlanNotFound,
    PlanNotApproved,
    PlanOwnershipViolation,
    PlanAlreadyExecuted,
    ExecutionNotFound,
    ExecutionAlreadyTerminal,
    AgentNotAvailable,
    AgentTimeout,
    AgentCrashed,
    WorkspaceError,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidMessageFormat => "INVALID_MESSAGE_FORMAT",
            Self::MissingSignature => "MISSING_SIGNATURE",
            Self::InvalidSignature => "INVALID_SIGNATURE",
            Self::NotAuthenticated => "NOT_AUTHENTICATED",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ReplayDetected => "REPLAY_DETECTED",
            Self::CommandExpired => "COMMAND_EXPIRED",
            Self::CommandFromFuture => "COMMAND_FROM_FUTURE",
            Self::OriginNotAllowed => "ORIGIN_NOT_ALLOWED",
            Self::PlanNotFound => "PLAN_NOT_FOUND",
            Self::PlanNotApproved => "PLAN_NOT_APPROVED",
            Self::PlanOwnershipViolation => "PLAN_OWNERSHIP_VIOLATION",
            Self::PlanAlreadyExecuted => "PLAN_ALREADY_EXECUTED",
            Self::ExecutionNotFound => "EXECUTION_NOT_FOUND",
            Self::ExecutionAlreadyTerminal => "EXECUTION_ALREADY_TERMINAL",
            Self::AgentNotAvailable => "AGENT_NOT_AVAILABLE",
            Self::AgentTimeout => "AGENT_TIMEOUT",
            Self::AgentCrashed => "AGENT_CRASHED",
            Self::WorkspaceError => "WORKSPACE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reply on both the message channel and the HTTP surface. `id` echoes
/// the offending envelope id when one was available.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub code: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}
