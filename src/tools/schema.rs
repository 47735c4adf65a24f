//! 回复格式 JSON Schema 生成（schemars）
//!
//! Planner / Reflector 把期望的 JSON 回复结构注入 prompt，减少 LLM 输出格式错误。

use schemars::{schema_for, JsonSchema};

/// 返回类型 T 的 JSON Schema 字符串，可拼入 prompt
pub fn json_schema_for<T: JsonSchema>() -> String {
    let schema = schema_for!(T);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
