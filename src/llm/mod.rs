//! LLM 层：客户端抽象、重试与各后端实现（Anthropic / OpenAI 兼容 / DeepSeek / Mock）

pub mod anthropic;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod traits;

pub use anthropic::AnthropicClient;
pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockLlmClient, RecordedCall};
pub use openai::OpenAiClient;
pub use provider::{create_llm_from_config, LlmProvider};
pub use retry::{fetch_with_retry, FetchOutcome, RetryPolicy};
pub use traits::{LlmClient, LlmError, LlmErrorCode, LlmResponse, TokenUsage};
