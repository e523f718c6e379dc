use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use dock_types::{ErrorCode, Plan, PlanState};

const UNAPPROVED_PLAN_TTL_MINUTES: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan not found")]
    NotFound,
    #[error("plan is not approved")]
    NotApproved,
    #[error("plan belongs to another session")]
    OwnershipViolation,
    #[error("plan was already executed")]
    AlreadyExecuted,
}

impl PlanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound => ErrorCode::PlanNotFound,
            Self::NotApproved => ErrorCode::PlanNotApproved,
            Self::OwnershipViolation => ErrorCode::PlanOwnershipViolation,
            Self::AlreadyExecuted => ErrorCode::PlanAlreadyExecuted,
        }
    }
}

/// Plan artifacts and their approval state machine. Only the owning session
/// may transition a plan.
#[derive(Clone)]
pub struct PlanRegistry {
    plans: Arc<RwLock<HashMap<String, Plan>>>,
}

impl PlanRegistry {
    pub fn new() -> Self {
        Self {
            plans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, plan: Plan) {
        self.plans.write().await.insert(plan.id.clone(), plan);
    }

    pub async fn get(&self, plan_id: &str) -> Option<Plan> {
        self.plans.read().await.get(plan_id).cloned()
    }

    pub async fn approve(&self, plan_id: &str, session_id: &str) -> Result<Plan, PlanError> {
        let mut plans = self.plans.write().await;
        let plan = plans.get_mut(plan_id).ok_or(PlanError::NotFound)?;
        if plan.session_id != session_id {
            return Err(PlanError::OwnershipViolation);
        }
        match plan.state {
            PlanState::Proposed => {}
            PlanState::Executed => return Err(PlanError::AlreadyExecuted),
            _ => return Err(PlanError::NotFound),
        }
        plan.state = PlanState::Approved;
        plan.approved_at = Some(Utc::now());
        debug!(plan_id, "plan approved");
        Ok(plan.clone())
    }

    /// Rejection is terminal; the plan is removed from the registry.
    pub async fn reject(
        &self,
        plan_id: &str,
        session_id: &str,
        reason: &str,
    ) -> Result<Plan, PlanError> {
        let mut plans = self.plans.write().await;
        let plan = plans.get(plan_id).ok_or(PlanError::NotFound)?;
        if plan.session_id != session_id {
            return Err(PlanError::OwnershipViolation);
        }
        if plan.state != PlanState::Proposed {
            return Err(PlanError::NotFound);
        }
        let mut plan = plans.remove(plan_id).ok_or(PlanError::NotFound)?;
        plan.state = PlanState::Rejected;
        plan.rejected_at = Some(Utc::now());
        plan.rejection_reason = Some(reason.to_string());
        debug!(plan_id, "plan rejected");
        Ok(plan)
    }

    /// Fetches a plan for dispatch, enforcing the APPROVED + ownership gate.
    pub async fn take_for_execution(
        &self,
        plan_id: &str,
        session_id: &str,
    ) -> Result<Plan, PlanError> {
        let plans = self.plans.read().await;
        let plan = plans.get(plan_id).ok_or(PlanError::NotFound)?;
        if plan.session_id != session_id {
            return Err(PlanError::OwnershipViolation);
        }
        match plan.state {
            PlanState::Approved => Ok(plan.clone()),
            PlanState::Proposed => Err(PlanError::NotApproved),
            PlanState::Executed => Err(PlanError::AlreadyExecuted),
            _ => Err(PlanError::NotFound),
        }
    }

    pub async fn mark_executed(&self, plan_id: &str) {
        let mut plans = self.plans.write().await;
        if let Some(plan) = plans.get_mut(plan_id) {
            plan.state = PlanState::Executed;
            plan.executed_at = Some(Utc::now());
        }
    }

    /// Garbage-collects PROPOSED plans older than 30 minutes.
    pub async fn sweep(&self) -> Vec<String> {
        let cutoff = Utc::now() - Duration::minutes(UNAPPROVED_PLAN_TTL_MINUTES);
        let mut plans = self.plans.write().await;
        let expired: Vec<String> = plans
            .iter()
            .filter(|(_, p)| p.state == PlanState::Proposed && p.created_at < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            plans.remove(id);
        }
        expired
    }

    pub async fn remove_for_session(&self, session_id: &str) -> usize {
        let mut plans = self.plans.write().await;
        let before = plans.len();
        plans.retain(|_, p| p.session_id != session_id);
        before - plans.len()
    }
}

impl Default for PlanRegistry {
    fn default() -> Self {
        Self::new()
    }
}
