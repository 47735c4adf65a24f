//! SelfReflector：每个计划步骤执行后判断结果是否符合预期
//!
//! - 干净成功（调用成功且结果不是错误形态）：零成本启发式，satisfied；还有 pending 步骤则 continue，否则 complete
//! - 其他情况：一次 LLM 调用给出 {isSatisfied, shouldContinue, nextAction, thoughts, corrections}
//! - LLM 失败或回复无法解析：continue，绝不卡住

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::planner::extract_json_object;
use crate::react::{ExecutionPlan, PlanStep, StepStatus};
use crate::tools::{json_schema_for, ToolExecution};

const DEFAULT_PROMPT: &str = "You review the result of one step in an agent's plan.\n\
Goal: {goal}\n\
Step: {step}\n\
Tool: {tool}\n\
Result: {observation}\n\n\
Decide whether the result satisfies the step. nextAction is one of continue, retry, skip, complete.\n\
Use retry only if a corrected attempt is likely to succeed. Reply with JSON only, matching this schema:\n{schema}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NextAction {
    Continue,
    Retry,
    Skip,
    Complete,
}

/// 反思结论
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    #[serde(default)]
    pub is_satisfied: bool,
    #[serde(default = "default_true")]
    pub should_continue: bool,
    #[serde(default = "default_next_action")]
    pub next_action: NextAction,
    #[serde(default)]
    pub thoughts: String,
    #[serde(default)]
    pub corrections: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_next_action() -> NextAction {
    NextAction::Continue
}

impl Reflection {
    /// 干净成功时的启发式结论
    pub fn heuristic(others_pending: bool) -> Self {
        Self {
            is_satisfied: true,
            should_continue: others_pending,
            next_action: if others_pending {
                NextAction::Continue
            } else {
                NextAction::Complete
            },
            thoughts: "Step succeeded".to_string(),
            corrections: None,
        }
    }

    /// 无法取得判断时的默认结论
    pub fn fallback(thoughts: impl Into<String>) -> Self {
        Self {
            is_satisfied: false,
            should_continue: true,
            next_action: NextAction::Continue,
            thoughts: thoughts.into(),
            corrections: None,
        }
    }
}

/// 反思器：持有 prompt 模板，LLM 由调用方按轮传入
pub struct SelfReflector {
    prompt_template: String,
    /// 关闭时只用启发式，失败步骤直接 continue
    use_oracle: bool,
}

impl Default for SelfReflector {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SelfReflector {
    pub fn new(use_oracle: bool) -> Self {
        Self {
            prompt_template: DEFAULT_PROMPT.to_string(),
            use_oracle,
        }
    }

    pub fn with_prompt_template(mut self, template: impl Into<String>) -> Self {
        self.prompt_template = template.into();
        self
    }

    pub async fn reflect_on_action_result(
        &self,
        step: &PlanStep,
        result: &ToolExecution,
        plan: &ExecutionPlan,
        llm: &dyn LlmClient,
        cancel: &CancellationToken,
    ) -> Reflection {
        let others_pending = plan
            .steps
            .iter()
            .any(|s| s.id != step.id && s.status == StepStatus::Pending);

        if result.is_clean_success() {
            return Reflection::heuristic(others_pending);
        }
        if !self.use_oracle {
            return Reflection::fallback("Step failed; reflection disabled");
        }

        let prompt = self
            .prompt_template
            .replace("{goal}", plan.goal())
            .replace("{step}", &step.description)
            .replace("{tool}", step.tool_name.as_deref().unwrap_or("(none)"))
            .replace("{observation}", &truncate(&result.observation(), 2000))
            .replace("{schema}", &json_schema_for::<Reflection>());

        match llm.call(&[Message::user(prompt)], None, cancel).await {
            Ok(response) => parse_reflection(&response.content).unwrap_or_else(|| {
                tracing::warn!(step = %step.id, "reflection reply not parseable, continuing");
                Reflection::fallback("Unparseable reflection")
            }),
            Err(e) => {
                tracing::warn!(step = %step.id, error = %e, "reflection call failed, continuing");
                Reflection::fallback(format!("Reflection unavailable: {e}"))
            }
        }
    }
}

pub fn parse_reflection(output: &str) -> Option<Reflection> {
    serde_json::from_str(extract_json_object(output)?).ok()
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
