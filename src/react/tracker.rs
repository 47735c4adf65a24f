//! PlanTracker：按依赖选择下一步、记录状态迁移、汇报进度
//!
//! 合法迁移只有四种：
//! - pending → in_progress（start_step，依赖须全部 completed，且当前无其他 in_progress 步骤）
//! - in_progress → completed / failed
//! - pending | in_progress → skipped
//!
//! failed 不阻塞完成判定；但依赖 failed 步骤的后续步骤永远不会被选中。

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::react::{ExecutionPlan, PlanStatus, PlanStep, StepStatus};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Illegal transition for step {step}: {from:?} -> {to:?}")]
    InvalidTransition {
        step: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Dependencies not completed for step {0}")]
    DependenciesNotMet(String),

    #[error("Another step is already in progress: {0}")]
    StepAlreadyActive(String),
}

/// 计划进度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pending: usize,
    pub in_progress: usize,
    pub percent: u8,
}

#[derive(Debug, Clone)]
pub struct PlanTracker {
    plan: ExecutionPlan,
}

impl PlanTracker {
    pub fn new(plan: ExecutionPlan) -> Self {
        Self { plan }
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn into_plan(self) -> ExecutionPlan {
        self.plan
    }

    /// 第一个依赖全部 completed 的 pending 步骤
    pub fn get_next_step(&self) -> Option<&PlanStep> {
        self.plan
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Pending && self.dependencies_met(s))
    }

    fn dependencies_met(&self, step: &PlanStep) -> bool {
        step.dependencies.iter().all(|dep| {
            self.plan
                .step(dep)
                .is_some_and(|d| d.status == StepStatus::Completed)
        })
    }

    fn step_mut(&mut self, id: &str) -> Result<&mut PlanStep, TrackerError> {
        self.plan
            .steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| TrackerError::StepNotFound(id.to_string()))
    }

    fn active_step(&self) -> Option<&PlanStep> {
        self.plan.steps.iter().find(|s| s.status == StepStatus::InProgress)
    }

    pub fn start_step(&mut self, id: &str) -> Result<(), TrackerError> {
        if let Some(active) = self.active_step() {
            if active.id != id {
                return Err(TrackerError::StepAlreadyActive(active.id.clone()));
            }
        }
        let ready = {
            let step = self
                .plan
                .step(id)
                .ok_or_else(|| TrackerError::StepNotFound(id.to_string()))?;
            if step.status != StepStatus::Pending {
                return Err(TrackerError::InvalidTransition {
                    step: id.to_string(),
                    from: step.status,
                    to: StepStatus::InProgress,
                });
            }
            self.dependencies_met(step)
        };
        if !ready {
            return Err(TrackerError::DependenciesNotMet(id.to_string()));
        }

        let step = self.step_mut(id)?;
        step.status = StepStatus::InProgress;
        step.started_at = Some(Utc::now());
        self.plan.current_step_id = Some(id.to_string());
        self.plan.status = PlanStatus::Active;
        tracing::debug!(step = id, "plan step started");
        Ok(())
    }

    /// 记录一次执行尝试（重试计数）
    pub fn record_attempt(&mut self, id: &str) -> Result<u32, TrackerError> {
        let step = self.step_mut(id)?;
        if step.status != StepStatus::InProgress {
            return Err(TrackerError::InvalidTransition {
                step: id.to_string(),
                from: step.status,
                to: StepStatus::InProgress,
            });
        }
        step.attempts += 1;
        Ok(step.attempts)
    }

    pub fn complete_step(&mut self, id: &str, result: Option<Value>) -> Result<(), TrackerError> {
        self.finish(id, StepStatus::Completed, |step| step.result = result)
    }

    pub fn fail_step(&mut self, id: &str, error: impl Into<String>) -> Result<(), TrackerError> {
        let error = error.into();
        self.finish(id, StepStatus::Failed, |step| step.error = Some(error))
    }

    pub fn skip_step(&mut self, id: &str, reason: Option<String>) -> Result<(), TrackerError> {
        let step = self.step_mut(id)?;
        if !matches!(step.status, StepStatus::Pending | StepStatus::InProgress) {
            return Err(TrackerError::InvalidTransition {
                step: id.to_string(),
                from: step.status,
                to: StepStatus::Skipped,
            });
        }
        step.status = StepStatus::Skipped;
        step.completed_at = Some(Utc::now());
        if reason.is_some() {
            step.error = reason;
        }
        self.after_transition(id);
        Ok(())
    }

    fn finish(
        &mut self,
        id: &str,
        to: StepStatus,
        apply: impl FnOnce(&mut PlanStep),
    ) -> Result<(), TrackerError> {
        let step = self.step_mut(id)?;
        if step.status != StepStatus::InProgress {
            return Err(TrackerError::InvalidTransition {
                step: id.to_string(),
                from: step.status,
                to,
            });
        }
        step.status = to;
        step.completed_at = Some(Utc::now());
        apply(step);
        self.after_transition(id);
        Ok(())
    }

    fn after_transition(&mut self, id: &str) {
        if self.plan.current_step_id.as_deref() == Some(id) {
            self.plan.current_step_id = None;
        }
        if self.is_complete() && !self.plan.is_empty() {
            self.plan.status = PlanStatus::Completed;
        }
    }

    /// 没有 pending / in_progress 步骤即完成；failed 不阻塞
    pub fn is_complete(&self) -> bool {
        self.plan
            .steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
    }

    /// 还有 pending 步骤但都被阻塞（依赖未 completed）
    pub fn is_blocked(&self) -> bool {
        !self.is_complete() && self.active_step().is_none() && self.get_next_step().is_none()
    }

    /// 放弃剩余步骤：pending / in_progress 全部跳过，计划标记为 failed
    pub fn abandon(&mut self, reason: &str) -> usize {
        let now = Utc::now();
        let mut skipped = 0;
        for step in self
            .plan
            .steps
            .iter_mut()
            .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
        {
            step.status = StepStatus::Skipped;
            step.error = Some(reason.to_string());
            step.completed_at = Some(now);
            skipped += 1;
        }
        self.plan.current_step_id = None;
        if skipped > 0 {
            self.plan.status = PlanStatus::Failed;
        }
        skipped
    }

    pub fn progress(&self) -> PlanProgress {
        let total = self.plan.steps.len();
        let completed = self.plan.count(StepStatus::Completed);
        let failed = self.plan.count(StepStatus::Failed);
        let skipped = self.plan.count(StepStatus::Skipped);
        let done = completed + failed + skipped;
        PlanProgress {
            total,
            completed,
            failed,
            skipped,
            pending: self.plan.count(StepStatus::Pending),
            in_progress: self.plan.count(StepStatus::InProgress),
            percent: if total == 0 {
                100
            } else {
                (done * 100 / total) as u8
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(steps: Vec<PlanStep>) -> PlanTracker {
        PlanTracker::new(ExecutionPlan::new("goal", steps))
    }

    #[test]
    fn test_dependency_order() {
        let mut t = tracker(vec![
            PlanStep::new("b", "second").with_dependencies(["a"]),
            PlanStep::new("a", "first"),
        ]);
        assert_eq!(t.get_next_step().unwrap().id, "a");
        assert_eq!(t.start_step("b"), Err(TrackerError::DependenciesNotMet("b".into())));

        t.start_step("a").unwrap();
        t.complete_step("a", None).unwrap();
        assert_eq!(t.get_next_step().unwrap().id, "b");
    }

    #[test]
    fn test_failed_dependency_blocks_forever() {
        let mut t = tracker(vec![
            PlanStep::new("a", "first"),
            PlanStep::new("b", "second").with_dependencies(["a"]),
        ]);
        t.start_step("a").unwrap();
        t.fail_step("a", "boom").unwrap();

        assert!(t.get_next_step().is_none());
        assert!(!t.is_complete());
        assert!(t.is_blocked());
        assert_eq!(t.plan().step("b").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_complete_with_failures() {
        let mut t = tracker(vec![
            PlanStep::new("a", "x"),
            PlanStep::new("b", "y"),
            PlanStep::new("c", "z"),
        ]);
        t.start_step("a").unwrap();
        t.complete_step("a", None).unwrap();
        t.start_step("b").unwrap();
        t.fail_step("b", "err").unwrap();
        t.skip_step("c", None).unwrap();

        assert!(t.is_complete());
        assert_eq!(t.plan().status, PlanStatus::Completed);
        let p = t.progress();
        assert_eq!((p.completed, p.failed, p.skipped, p.percent), (1, 1, 1, 100));
    }

    #[test]
    fn test_illegal_transitions() {
        let mut t = tracker(vec![PlanStep::new("a", "x"), PlanStep::new("b", "y")]);
        assert!(matches!(
            t.complete_step("a", None),
            Err(TrackerError::InvalidTransition { .. })
        ));
        t.start_step("a").unwrap();
        assert_eq!(t.start_step("b"), Err(TrackerError::StepAlreadyActive("a".into())));
        t.complete_step("a", None).unwrap();
        assert!(t.skip_step("a", None).is_err());
        assert_eq!(t.start_step("zz"), Err(TrackerError::StepNotFound("zz".into())));
    }

    #[test]
    fn test_abandon_skips_remaining() {
        let mut t = tracker(vec![PlanStep::new("a", "x"), PlanStep::new("b", "y")]);
        t.start_step("a").unwrap();
        assert_eq!(t.abandon("timeout"), 2);
        assert!(t.is_complete());
        assert_eq!(t.plan().status, PlanStatus::Failed);
    }

    #[test]
    fn test_empty_plan_is_complete() {
        let t = tracker(Vec::new());
        assert!(t.is_complete());
        assert_eq!(t.progress().percent, 100);
    }
}
