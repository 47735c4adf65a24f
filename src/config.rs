//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `PILOT__*` 覆盖（双下划线表示嵌套，如 `PILOT__LLM__PROVIDER=openai`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::llm::RetryPolicy;
use crate::tools::DEFAULT_WRITE_PREFIXES;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub agent: AgentSection,
    pub tools: ToolsSection,
}

/// [app] 段：应用名、系统提示、历史条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 覆盖内置的系统提示
    pub system_prompt: Option<String>,
    /// 每轮从存储加载的历史消息条数
    pub history_limit: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            system_prompt: None,
            history_limit: 20,
        }
    }
}

/// [llm] 段：后端选择
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// anthropic / openai / deepseek / mock
    pub provider: String,
    /// 未设置时使用各后端的默认模型
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名；未设置时按 provider 取默认（ANTHROPIC_API_KEY 等）
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub retry: LlmRetrySection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "anthropic".to_string(),
            model: None,
            base_url: None,
            api_key_env: None,
            max_tokens: 1024,
            retry: LlmRetrySection::default(),
        }
    }
}

/// [llm.retry] 段：传输层重试
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmRetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    pub request_timeout_secs: u64,
}

impl Default for LlmRetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.2,
            request_timeout_secs: 60,
        }
    }
}

impl LlmRetrySection {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms.max(self.base_delay_ms)),
            jitter: self.jitter.clamp(0.0, 1.0),
            request_timeout: Duration::from_secs(self.request_timeout_secs.max(1)),
        }
    }
}

/// [agent] 段：一轮对话的护栏与规划参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// 单轮最多迭代次数（规划步骤 + 工具轮次）
    pub max_iterations: u32,
    /// 单轮最长耗时（秒）
    pub max_duration_secs: u64,
    /// 发给 LLM 的上下文 token 预算
    pub token_budget: usize,
    /// 计划最多步骤数
    pub max_plan_steps: usize,
    /// 单个计划步骤失败后的重试次数
    pub max_step_retries: u32,
    /// 短于该字符数且无动作词的消息视为闲聊，跳过规划
    pub conversational_max_chars: usize,
    /// 是否启用 LLM 自我反思（关闭时只用启发式）
    pub reflection: bool,
    /// 追加在系统提示后的补充说明
    pub instructions: Option<String>,
    /// 待确认写操作的保留时长（秒），过期后无法再确认
    pub pending_action_ttl_secs: u64,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_duration_secs: 120,
            token_budget: 8_000,
            max_plan_steps: 8,
            max_step_retries: 1,
            conversational_max_chars: 40,
            reflection: true,
            instructions: None,
            pending_action_ttl_secs: 3600,
        }
    }
}

impl AgentSection {
    pub fn max_duration(&self) -> Duration {
        Duration::from_secs(self.max_duration_secs.max(1))
    }

    pub fn pending_action_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_action_ttl_secs.max(1))
    }
}

/// [tools] 段：工具超时、缓存与写操作前缀
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub tool_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    /// 名称以这些动词开头的工具需用户确认
    pub write_prefixes: Vec<String>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            cache_ttl_secs: 300,
            cache_max_entries: 256,
            write_prefixes: DEFAULT_WRITE_PREFIXES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// 加载配置
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(environment_source());

    let c = builder.build()?;
    c.try_deserialize()
}

/// `PILOT__*` 环境变量；列表字段用逗号分隔（如 `PILOT__TOOLS__WRITE_PREFIXES=create,archive`）
fn environment_source() -> config::Environment {
    config::Environment::with_prefix("PILOT")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("tools.write_prefixes")
}
