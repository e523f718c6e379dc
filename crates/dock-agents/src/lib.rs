pub mod catalog;
pub mod plan_extract;
pub mod ring;
pub mod supervisor;

pub use catalog::{AgentBinary, AgentCatalog};
pub use plan_extract::{assess_plan, extract_file_hints, extract_plan, PlanExtract};
pub use ring::OutputRing;
pub use supervisor::{
    AgentFrame, AgentHandle, AgentStdin, AgentSupervisor, ExecOutcome, OutputFrame, PlanSession,
};

use dock_types::{AgentKind, ErrorCode};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent {} is not installed", .0.as_str())]
    NotInstalled(AgentKind),
    #[error("failed to spawn agent: {0}")]
    Spawn(std::io::Error),
    #[error("agent io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("plan production failed (exit code {exit_code})")]
    PlanFailed { exit_code: i32 },
    #[error("agent exceeded its time budget")]
    Timeout,
    #[error("agent run was aborted")]
    Aborted,
    #[error("agent crashed (exit code {exit_code})")]
    Crashed { exit_code: i32 },
}

impl AgentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotInstalled(_) | Self::Spawn(_) => ErrorCode::AgentNotAvailable,
            Self::Timeout => ErrorCode::AgentTimeout,
            Self::PlanFailed { .. } | Self::Crashed { .. } => ErrorCode::AgentCrashed,
            Self::Aborted | Self::Io(_) => ErrorCode::Internal,
        }
    }
}
