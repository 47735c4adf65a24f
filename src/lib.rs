//! Pilot - 自主工具调用 Agent 引擎
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 编排状态机、状态、护栏、遥测、动作记录与响应构建
//! - **llm**: LLM 客户端抽象与实现（Anthropic / OpenAI 兼容 / DeepSeek / Mock），重试与退避
//! - **memory**: 对话消息、token 预算、对话存储接口
//! - **observability**: 日志初始化
//! - **react**: 计划、PlanGenerator、PlanTracker、SelfReflector、CompletionVerifier、进度事件
//! - **tools**: Tool trait、注册表、读写分类、TTL 缓存、执行器与演示任务工具

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentBuilder, ExecutionResult, Orchestrator, TurnRequest};
