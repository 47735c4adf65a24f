//! PlanGenerator：让 LLM 把请求拆解为按依赖排序的步骤
//!
//! 回复格式：`{goal, steps:[{description, toolName|null, parameters|null, dependsOn?}]}`，
//! 可包在 ```json 代码块里，也可以是裸 JSON。解析失败不报错，退化为确定性的兜底计划：
//! 短的闲聊输入 → 零步骤计划；其他输入 → 单个不绑定工具的「处理请求」步骤。
//! 只有 LLM 传输错误会返回 Err，由编排器决定是否短路。

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::llm::{LlmClient, LlmError};
use crate::memory::Message;
use crate::react::{ExecutionPlan, PlanStep};
use crate::tools::{json_schema_for, ToolSpec};

/// 出现这些词时不视为闲聊
const ACTION_WORDS: [&str; 20] = [
    "list", "show", "get", "find", "search", "create", "add", "new", "log", "update", "change",
    "set", "mark", "delete", "remove", "complete", "finish", "move", "schedule", "how many",
];

/// LLM 规划回复
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanReply {
    /// 用户目标的一句话概括
    #[serde(default)]
    pub goal: String,
    /// 纯对话时为空数组
    #[serde(default)]
    pub steps: Vec<PlanReplyStep>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanReplyStep {
    pub description: String,
    /// 可用工具之一；无需工具时为 null
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    /// 依赖的前序步骤序号（从 1 开始）
    #[serde(default)]
    pub depends_on: Vec<usize>,
}

/// 从 LLM 输出中提取 JSON 对象文本：优先 ``` 代码块，其次第一个 `{` 到最后一个 `}`
pub fn extract_json_object(output: &str) -> Option<&str> {
    static FENCED: OnceLock<Option<Regex>> = OnceLock::new();
    let fenced = FENCED.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").ok());

    let trimmed = output.trim();
    if let Some(caps) = fenced.as_ref().and_then(|re| re.captures(trimmed)) {
        if let Some(m) = caps.get(1) {
            return Some(m.as_str());
        }
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

pub struct PlanGenerator {
    max_steps: usize,
    conversational_max_chars: usize,
}

impl Default for PlanGenerator {
    fn default() -> Self {
        Self::new(8, 40)
    }
}

impl PlanGenerator {
    pub fn new(max_steps: usize, conversational_max_chars: usize) -> Self {
        Self {
            max_steps: max_steps.max(1),
            conversational_max_chars,
        }
    }

    /// 生成计划；解析失败时返回兜底计划，仅传输错误返回 Err
    pub async fn generate_plan(
        &self,
        request: &str,
        tools: &[ToolSpec],
        llm: &dyn LlmClient,
        cancel: &CancellationToken,
    ) -> Result<ExecutionPlan, LlmError> {
        let messages = vec![
            Message::system(self.build_prompt(tools)),
            Message::user(request),
        ];
        let response = llm.call(&messages, None, cancel).await?;

        match self.parse_plan(&response.content, request, tools) {
            Some(plan) => {
                tracing::info!(steps = plan.steps.len(), goal = %plan.goal(), "plan generated");
                Ok(plan)
            }
            None => {
                tracing::warn!("plan reply not parseable, using fallback plan");
                Ok(self.fallback_plan(request))
            }
        }
    }

    fn build_prompt(&self, tools: &[ToolSpec]) -> String {
        let tool_list = if tools.is_empty() {
            "(no tools available)".to_string()
        } else {
            tools
                .iter()
                .map(|t| format!("- {}: {}\n  parameters: {}", t.name, t.description, t.parameters))
                .collect::<Vec<_>>()
                .join("\n")
        };
        format!(
            "You are a planning assistant. Break the user's request into at most {max} ordered steps.\n\
             Bind a step to a tool only when the tool is listed below, using its exact name and parameters.\n\
             If the message is purely conversational (greeting, thanks, small talk), return an empty steps array.\n\
             Use dependsOn with 1-based step numbers when a step needs an earlier step's result.\n\n\
             Available tools:\n{tools}\n\n\
             Reply with JSON only, matching this schema:\n{schema}",
            max = self.max_steps,
            tools = tool_list,
            schema = json_schema_for::<PlanReply>(),
        )
    }

    /// 解析 LLM 回复为计划；无法解析时返回 None
    pub fn parse_plan(&self, output: &str, request: &str, tools: &[ToolSpec]) -> Option<ExecutionPlan> {
        let json_str = extract_json_object(output)?;
        let reply: PlanReply = serde_json::from_str(json_str).ok()?;

        let known: HashSet<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        let goal = if reply.goal.trim().is_empty() {
            request.trim().to_string()
        } else {
            reply.goal.trim().to_string()
        };

        let steps = reply
            .steps
            .into_iter()
            .take(self.max_steps)
            .enumerate()
            .map(|(index, s)| {
                let mut step = PlanStep::new(step_id(index + 1), s.description.trim());
                match s.tool_name.filter(|n| !n.trim().is_empty()) {
                    Some(name) if known.contains(name.as_str()) => {
                        step = step.with_tool(name, s.parameters.unwrap_or_else(|| json!({})));
                    }
                    Some(name) => {
                        tracing::warn!(tool = %name, "plan references unknown tool, dropping binding");
                    }
                    None => {}
                }
                // 只允许引用更早的步骤，避免环
                let deps: Vec<String> = s
                    .depends_on
                    .into_iter()
                    .filter(|&n| n >= 1 && n <= index)
                    .map(step_id)
                    .collect();
                step.with_dependencies(deps)
            })
            .collect();

        Some(ExecutionPlan::new(goal, steps))
    }

    /// 兜底计划
    pub fn fallback_plan(&self, request: &str) -> ExecutionPlan {
        let goal = request.trim();
        if self.is_conversational(goal) {
            ExecutionPlan::empty(goal)
        } else {
            ExecutionPlan::new(
                goal,
                vec![PlanStep::new(step_id(1), format!("Process the request: {goal}"))],
            )
        }
    }

    pub fn is_conversational(&self, text: &str) -> bool {
        let lower = text.trim().to_lowercase();
        if lower.is_empty() {
            return true;
        }
        if lower.chars().count() > self.conversational_max_chars {
            return false;
        }
        !ACTION_WORDS.iter().any(|w| {
            lower
                .match_indices(w)
                .any(|(i, _)| is_word_at(&lower, i, w.len()))
        })
    }
}

fn step_id(n: usize) -> String {
    format!("step_{n}")
}

fn is_word_at(text: &str, start: usize, len: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[start + len..].chars().next();
    let boundary = |c: Option<char>| c.map_or(true, |c| !c.is_alphanumeric());
    boundary(before) && boundary(after)
}
