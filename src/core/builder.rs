//! Agent 构建器：统一的编排器初始化逻辑
//!
//! CLI 与测试共用同一套组装方式；未显式注入的组件按配置创建（LLM 后端、内存存储、系统时钟）。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{Guardrails, Orchestrator};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::memory::{ConversationStore, InMemoryConversationStore};
use crate::react::{PlanGenerator, ProgressStreamer, SelfReflector};
use crate::tools::{Clock, SystemClock, ToolClassifier, ToolExecutor, ToolRegistry, TtlCache};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are Pilot, a helpful assistant that gets things done with the tools \
available to you. Use tools to look up information before answering. Actions that create, update or delete data \
are shown to the user for confirmation before they run.";

/// 编排器构建器
pub struct AgentBuilder {
    config: AppConfig,
    system_prompt: Option<String>,
    llm: Option<Arc<dyn LlmClient>>,
    store: Option<Arc<dyn ConversationStore>>,
    streamer: Option<Arc<ProgressStreamer>>,
    clock: Option<Arc<dyn Clock>>,
    registry: ToolRegistry,
}

impl AgentBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            system_prompt: None,
            llm: None,
            store: None,
            streamer: None,
            clock: None,
            registry: ToolRegistry::new(),
        }
    }

    /// 覆盖配置与内置的系统提示
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_streamer(mut self, streamer: Arc<ProgressStreamer>) -> Self {
        self.streamer = Some(streamer);
        self
    }

    /// 注入时钟：缓存 TTL 与待确认动作的过期都以它为准
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    fn system_prompt(&self) -> String {
        let base = self
            .system_prompt
            .clone()
            .or_else(|| self.config.app.system_prompt.clone())
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        match self.config.agent.instructions.as_deref().map(str::trim) {
            Some(extra) if !extra.is_empty() => format!("{base}\n\n{extra}"),
            _ => base,
        }
    }

    pub fn build(self) -> Orchestrator {
        let system_prompt = self.system_prompt();
        let AgentBuilder {
            config,
            llm,
            store,
            streamer,
            clock,
            registry,
            ..
        } = self;

        let llm = llm.unwrap_or_else(|| create_llm_from_config(&config));
        let store = store.unwrap_or_else(|| Arc::new(InMemoryConversationStore::new()));
        let streamer = streamer.unwrap_or_default();
        let clock = clock.unwrap_or_else(|| Arc::new(SystemClock));

        let tools_cfg = &config.tools;
        let cache = TtlCache::with_clock(
            Duration::from_secs(tools_cfg.cache_ttl_secs),
            tools_cfg.cache_max_entries,
            clock.clone(),
        );
        let executor = ToolExecutor::new(registry, tools_cfg.tool_timeout_secs)
            .with_cache(Arc::new(cache))
            .with_classifier(ToolClassifier::new(tools_cfg.write_prefixes.iter().cloned()));

        let agent = &config.agent;
        tracing::info!(
            provider = llm.provider(),
            model = llm.model(),
            tools = executor.registry().len(),
            max_iterations = agent.max_iterations,
            "orchestrator ready"
        );

        let mut orchestrator = Orchestrator::new(
            llm,
            Arc::new(executor),
            store,
            streamer,
            PlanGenerator::new(agent.max_plan_steps, agent.conversational_max_chars),
            SelfReflector::new(agent.reflection),
            Guardrails::new(agent.max_iterations, agent.max_duration()),
            system_prompt,
        );
        orchestrator.history_limit = config.app.history_limit;
        orchestrator.token_budget = agent.token_budget;
        orchestrator.max_step_retries = agent.max_step_retries;
        orchestrator.pending_ttl = agent.pending_action_ttl();
        orchestrator.clock = clock;
        orchestrator
    }
}
