//! 工具调用：规范化序列化、去重、读写分类
//!
//! - canonical_json：对象键排序后的紧凑 JSON，字段顺序不同但结构相同的参数得到相同字符串
//! - tool_signature：一批待执行调用的签名，供循环检测使用
//! - ToolClassifier：按名称动词前缀把工具分为 Read（自动执行、可缓存）与 Write（需确认）

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 默认写操作动词前缀
pub const DEFAULT_WRITE_PREFIXES: [&str; 6] = ["create", "add", "log", "update", "bulk", "delete"];

/// 单次工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub parameters: Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            id: format!("call_{}", uuid::Uuid::new_v4().simple()),
            name: name.into(),
            parameters,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 去重键：名称 + 规范化参数（忽略 id）
    pub fn dedupe_key(&self) -> String {
        format!("{}:{}", self.name, canonical_json(&self.parameters))
    }
}

/// 规范化 JSON：对象键按字典序输出，无多余空白
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// 一批调用的签名（保持调用顺序，忽略 id 与参数键顺序）
pub fn tool_signature(calls: &[ToolCall]) -> String {
    calls
        .iter()
        .map(ToolCall::dedupe_key)
        .collect::<Vec<_>>()
        .join("|")
}

/// 去重：名称与规范化参数相同的调用只保留首次出现，顺序不变
pub fn dedupe_tool_calls(calls: &[ToolCall]) -> Vec<ToolCall> {
    let mut seen = HashSet::new();
    calls
        .iter()
        .filter(|c| seen.insert(c.dedupe_key()))
        .cloned()
        .collect()
}

/// 操作类型（Action 记录中的 type 字段）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Read,
    Write,
}

/// 读写分类器：名称以写动词开头（其后为词边界）即为 Write
#[derive(Debug, Clone)]
pub struct ToolClassifier {
    write_prefixes: Vec<String>,
}

impl ToolClassifier {
    pub fn new<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            write_prefixes: prefixes
                .into_iter()
                .map(|p| p.into().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    pub fn classify(&self, tool_name: &str) -> ActionKind {
        if self.is_write(tool_name) {
            ActionKind::Write
        } else {
            ActionKind::Read
        }
    }

    /// "delete_task" / "deleteTask" / "delete" 命中 "delete"；"logs_export" 不命中 "log"
    pub fn is_write(&self, tool_name: &str) -> bool {
        let lower = tool_name.to_lowercase();
        self.write_prefixes.iter().any(|prefix| {
            if !lower.starts_with(prefix.as_str()) {
                return false;
            }
            let Some(rest) = tool_name.get(prefix.len()..) else {
                return false;
            };
            match rest.chars().next() {
                None => true,
                Some(c) => matches!(c, '_' | '-' | '.') || c.is_ascii_uppercase(),
            }
        })
    }

    pub fn prefixes(&self) -> &[String] {
        &self.write_prefixes
    }
}

impl Default for ToolClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_WRITE_PREFIXES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_is_order_insensitive() {
        let a: Value = serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
        assert_eq!(canonical_json(&a), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn test_canonical_nested() {
        let v = json!({"z": [{"y": true, "x": null}], "a": "s"});
        assert_eq!(canonical_json(&v), r#"{"a":"s","z":[{"x":null,"y":true}]}"#);
    }

    #[test]
    fn test_signature_ignores_ids_and_key_order() {
        let first = vec![ToolCall::new("get_tasks", json!({"status": "done", "limit": 1}))];
        let second = vec![ToolCall::new("get_tasks", json!({"limit": 1, "status": "done"}))];
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(tool_signature(&first), tool_signature(&second));
    }

    #[test]
    fn test_dedupe_keeps_first_occurrence_order() {
        let calls = vec![
            ToolCall::new("get_tasks", json!({"status": "done"})).with_id("1"),
            ToolCall::new("get_tasks", json!({"status": "done"})).with_id("2"),
            ToolCall::new("get_tasks", json!({"status": "to_do"})).with_id("3"),
        ];
        let deduped = dedupe_tool_calls(&calls);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "1");
        assert_eq!(deduped[1].id, "3");
    }

    #[test]
    fn test_classifier_write_prefixes() {
        let c = ToolClassifier::default();
        assert_eq!(c.classify("delete_task"), ActionKind::Write);
        assert_eq!(c.classify("createTask"), ActionKind::Write);
        assert_eq!(c.classify("bulk_update"), ActionKind::Write);
        assert_eq!(c.classify("log"), ActionKind::Write);
        assert_eq!(c.classify("get_tasks"), ActionKind::Read);
        assert_eq!(c.classify("logs_export"), ActionKind::Read);
        assert_eq!(c.classify("address_lookup"), ActionKind::Read);
    }

    #[test]
    fn test_classifier_custom_prefixes() {
        let c = ToolClassifier::new(["send"]);
        assert!(c.is_write("send_email"));
        assert!(!c.is_write("delete_task"));
    }
}
