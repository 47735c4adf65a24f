//! CompletionVerifier：按终态统计步骤，生成确定性的叙述
//!
//! 叙述只在 LLM 未能给出总结时作为兜底使用。

use serde::Serialize;

use crate::react::{ExecutionPlan, StepStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub is_complete: bool,
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// pending + in_progress
    pub remaining: usize,
    pub narrative: String,
}

pub fn verify_plan_complete(plan: &ExecutionPlan) -> CompletionReport {
    let completed = plan.count(StepStatus::Completed);
    let failed = plan.count(StepStatus::Failed);
    let skipped = plan.count(StepStatus::Skipped);
    let remaining = plan.count(StepStatus::Pending) + plan.count(StepStatus::InProgress);
    let is_complete = remaining == 0;

    let mut narrative = format!(
        "Plan {} {}: {} completed, {} failed",
        plan.goal(),
        if is_complete { "finished" } else { "stopped" },
        completed,
        failed
    );
    if skipped > 0 {
        narrative.push_str(&format!(", {skipped} skipped"));
    }
    if !is_complete {
        narrative.push_str(&format!(", {remaining} pending"));
    }

    CompletionReport {
        is_complete,
        total: plan.steps.len(),
        completed,
        failed,
        skipped,
        remaining,
        narrative,
    }
}
