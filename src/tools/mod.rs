//! 工具层：Tool trait 与注册表、调用规范化与读写分类、TTL 缓存、执行器、演示工具

pub mod cache;
pub mod call;
pub mod executor;
pub mod registry;
pub mod schema;
pub mod tasks;

pub use cache::{CacheEntry, Clock, SystemClock, TtlCache};
pub use call::{
    canonical_json, dedupe_tool_calls, tool_signature, ActionKind, ToolCall, ToolClassifier,
    DEFAULT_WRITE_PREFIXES,
};
pub use executor::{ToolExecution, ToolExecutor};
pub use registry::{required_from_schema, Tool, ToolRegistry, ToolSpec};
pub use schema::json_schema_for;
pub use tasks::TaskBoard;
