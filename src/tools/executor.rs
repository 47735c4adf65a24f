//! 工具执行器
//!
//! execute_tool 的固定流程：
//! 1. 按工具 required 列表校验参数，缺失时直接返回结构化失败（不调用工具）
//! 2. 非 object / array 的参数统一规范化为 {}
//! 3. Read 类工具按 (user_id, tool, canonical_json(params)) 查 TTL 缓存
//! 4. 在超时内调用工具；Err、超时、panic、取消都转为失败结果，绝不向上抛出
//!
//! 每次调用输出一条结构化审计日志（JSON）。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::tools::{canonical_json, ActionKind, Tool, ToolCall, ToolClassifier, ToolRegistry, TtlCache};

/// 默认缓存 TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(300);
/// 默认缓存容量
pub const DEFAULT_CACHE_ENTRIES: usize = 256;

/// 单次工具执行结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_name: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 校验失败时缺失的必填参数
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_params: Vec<String>,
    pub duration_ms: u64,
    pub cached: bool,
}

impl ToolExecution {
    fn ok(tool_name: &str, result: Value, duration_ms: u64, cached: bool) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            result: Some(result),
            error: None,
            missing_params: Vec::new(),
            duration_ms,
            cached,
        }
    }

    pub fn failure(tool_name: &str, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            result: None,
            error: Some(error.into()),
            missing_params: Vec::new(),
            duration_ms,
            cached: false,
        }
    }

    /// 成功返回但结果本身表示失败（含 error 字段或 success=false）
    pub fn is_error_shaped(&self) -> bool {
        match &self.result {
            Some(Value::Object(map)) => {
                map.get("error").is_some_and(|e| !e.is_null())
                    || map.get("success") == Some(&Value::Bool(false))
            }
            _ => false,
        }
    }

    /// 干净成功：调用成功且结果不是错误形态
    pub fn is_clean_success(&self) -> bool {
        self.success && !self.is_error_shaped()
    }

    /// 写回对话的观察文本
    pub fn observation(&self) -> String {
        if self.success {
            self.result
                .as_ref()
                .map(Value::to_string)
                .unwrap_or_else(|| "null".to_string())
        } else {
            json!({
                "error": self.error.as_deref().unwrap_or("unknown error"),
                "missingParams": self.missing_params,
            })
            .to_string()
        }
    }
}

/// 工具执行器：校验、规范化、缓存、超时与错误隔离
pub struct ToolExecutor {
    registry: ToolRegistry,
    cache: Arc<TtlCache<Value>>,
    classifier: ToolClassifier,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            cache: Arc::new(TtlCache::new(DEFAULT_CACHE_TTL, DEFAULT_CACHE_ENTRIES)),
            classifier: ToolClassifier::default(),
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    /// 注入共享缓存（测试中可配合手动时钟）
    pub fn with_cache(mut self, cache: Arc<TtlCache<Value>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_classifier(mut self, classifier: ToolClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.registry.get(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn classify(&self, tool_name: &str) -> ActionKind {
        self.classifier.classify(tool_name)
    }

    pub fn cache(&self) -> &Arc<TtlCache<Value>> {
        &self.cache
    }

    /// 用户段带长度前缀，避免 `u1` 与 `u1:x` 的前缀互相覆盖
    fn user_prefix(user_id: &str) -> String {
        format!("{}:{}:", user_id.len(), user_id)
    }

    pub fn cache_key(user_id: &str, tool_name: &str, params: &Value) -> String {
        format!("{}{}:{}", Self::user_prefix(user_id), tool_name, canonical_json(params))
    }

    /// 写操作成功后丢弃该用户的读缓存
    pub fn invalidate_user(&self, user_id: &str) -> usize {
        self.cache.invalidate_prefix(&Self::user_prefix(user_id))
    }

    /// 按名称查找工具并执行；未注册的工具返回失败结果
    pub async fn execute_call(
        &self,
        call: &ToolCall,
        user_id: &str,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> ToolExecution {
        match self.registry.get(&call.name) {
            Some(tool) => self.execute_tool(&tool, call, user_id, use_cache, cancel).await,
            None => {
                tracing::warn!(tool = %call.name, "unknown tool requested");
                ToolExecution::failure(&call.name, format!("Unknown tool: {}", call.name), 0)
            }
        }
    }

    pub async fn execute_tool(
        &self,
        tool: &Arc<dyn Tool>,
        call: &ToolCall,
        user_id: &str,
        use_cache: bool,
        cancel: &CancellationToken,
    ) -> ToolExecution {
        let name = tool.name().to_string();

        let missing = missing_required(&tool.required_params(), &call.parameters);
        if !missing.is_empty() {
            tracing::info!(tool = %name, missing = ?missing, "tool call rejected: missing parameters");
            let mut failed = ToolExecution::failure(
                &name,
                format!("Missing required parameters: {}", missing.join(", ")),
                0,
            );
            failed.missing_params = missing;
            return failed;
        }

        let params = normalize_parameters(&call.parameters);
        let cacheable = use_cache && self.classifier.classify(&name) == ActionKind::Read;
        let key = Self::cache_key(user_id, &name, &params);

        if cacheable {
            if let Some(hit) = self.cache.get(&key) {
                tracing::debug!(tool = %name, "tool cache hit");
                return ToolExecution::ok(&name, hit, 0, true);
            }
        }

        let start = Instant::now();
        let invoke = AssertUnwindSafe(tool.execute(params.clone())).catch_unwind();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err("cancelled".to_string()),
            res = timeout(self.timeout, invoke) => match res {
                Err(_) => Err(format!("Tool '{}' timed out after {}s", name, self.timeout.as_secs())),
                Ok(Err(panic)) => Err(format!("Tool '{}' panicked: {}", name, panic_message(panic.as_ref()))),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Ok(Ok(value))) => Ok(value),
            },
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let audit = json!({
            "event": "tool_audit",
            "tool": name,
            "user": user_id,
            "ok": outcome.is_ok(),
            "duration_ms": duration_ms,
            "args_preview": args_preview(&params),
        });
        tracing::info!(audit = %audit, "tool");

        match outcome {
            Ok(value) => {
                let execution = ToolExecution::ok(&name, value, duration_ms, false);
                if cacheable && !execution.is_error_shaped() {
                    if let Some(value) = &execution.result {
                        self.cache.set(key, value.clone());
                    }
                }
                execution
            }
            Err(e) => ToolExecution::failure(&name, e, duration_ms),
        }
    }
}

/// 缺失（不存在或为 null）的必填参数，保持 required 列表顺序
pub fn missing_required(required: &[String], params: &Value) -> Vec<String> {
    required
        .iter()
        .filter(|key| params.get(key.as_str()).map_or(true, Value::is_null))
        .cloned()
        .collect()
}

/// 非 object / array 的参数规范化为 {}
pub fn normalize_parameters(params: &Value) -> Value {
    match params {
        Value::Object(_) | Value::Array(_) => params.clone(),
        _ => Value::Object(Default::default()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::tools::cache::ManualClock;

    struct Counting {
        name: &'static str,
        calls: Arc<AtomicUsize>,
        behavior: fn(Value) -> Result<Value, String>,
    }

    #[async_trait]
    impl Tool for Counting {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "counting test tool"
        }

        fn parameters_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"status": {"type": "string"}, "title": {"type": "string"}},
                "required": ["status"]
            })
        }

        async fn execute(&self, args: Value) -> Result<Value, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.behavior)(args)
        }
    }

    /// 第一次返回错误形态结果，之后恢复
    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for Flaky {
        fn name(&self) -> &str {
            "get_tasks"
        }

        fn description(&self) -> &str {
            "flaky test tool"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {"status": {"type": "string"}}})
        }

        async fn execute(&self, _args: Value) -> Result<Value, String> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(json!({"error": "backend temporarily unavailable"}))
            } else {
                Ok(json!({"tasks": [1]}))
            }
        }
    }

    fn setup(name: &'static str, behavior: fn(Value) -> Result<Value, String>) -> (ToolExecutor, Arc<dyn Tool>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool: Arc<dyn Tool> = Arc::new(Counting { name, calls: calls.clone(), behavior });
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        (ToolExecutor::new(registry, 5), tool, calls)
    }

    #[tokio::test]
    async fn test_missing_required_never_invokes() {
        let (executor, tool, calls) = setup("get_tasks", |a| Ok(a));
        let call = ToolCall::new("get_tasks", json!({"title": "x", "status": null}));

        let res = executor
            .execute_tool(&tool, &call, "u1", true, &CancellationToken::new())
            .await;

        assert!(!res.success);
        assert_eq!(res.missing_params, vec!["status".to_string()]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_read_tool_cached_within_ttl() {
        let (executor, tool, calls) = setup("get_tasks", |_| Ok(json!({"tasks": []})));
        let cancel = CancellationToken::new();
        let first = ToolCall::new("get_tasks", json!({"status": "done", "title": "a"}));
        let second = ToolCall::new("get_tasks", json!({"title": "a", "status": "done"}));

        let r1 = executor.execute_tool(&tool, &first, "u1", true, &cancel).await;
        let r2 = executor.execute_tool(&tool, &second, "u1", true, &cancel).await;

        assert!(r1.success && !r1.cached);
        assert!(r2.success && r2.cached);
        assert_eq!(r2.result, r1.result);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_expires_with_injected_clock() {
        let (executor, tool, calls) = setup("get_tasks", |_| Ok(json!(1)));
        let clock = Arc::new(ManualClock::new());
        let executor = executor.with_cache(Arc::new(TtlCache::with_clock(
            Duration::from_secs(30),
            16,
            clock.clone(),
        )));
        let cancel = CancellationToken::new();
        let call = ToolCall::new("get_tasks", json!({"status": "done"}));

        executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        clock.advance(Duration::from_secs(31));
        let again = executor.execute_tool(&tool, &call, "u1", true, &cancel).await;

        assert!(!again.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_is_per_user() {
        let (executor, tool, calls) = setup("get_tasks", |_| Ok(json!(1)));
        let cancel = CancellationToken::new();
        let call = ToolCall::new("get_tasks", json!({"status": "done"}));
        executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        executor.execute_tool(&tool, &call, "u2", true, &cancel).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_error_shaped_read_is_not_cached() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let tool: Arc<dyn Tool> = Arc::new(Flaky { calls: seen });
        let mut registry = ToolRegistry::new();
        registry.register_arc(tool.clone());
        let executor = ToolExecutor::new(registry, 5);
        let cancel = CancellationToken::new();
        let call = ToolCall::new("get_tasks", json!({"status": "open"}));

        let r1 = executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        let r2 = executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        let r3 = executor.execute_tool(&tool, &call, "u1", true, &cancel).await;

        assert!(!r1.is_clean_success());
        assert!(!r2.cached);
        assert_eq!(r2.result, Some(json!({"tasks": [1]})));
        assert!(r3.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_user_leaves_similar_ids() {
        let (executor, tool, calls) = setup("get_tasks", |_| Ok(json!(1)));
        let cancel = CancellationToken::new();
        let call = ToolCall::new("get_tasks", json!({"status": "done"}));
        executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        executor.execute_tool(&tool, &call, "u1:x", true, &cancel).await;

        assert_eq!(executor.invalidate_user("u1"), 1);
        let other = executor.execute_tool(&tool, &call, "u1:x", true, &cancel).await;
        assert!(other.cached);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_write_tool_never_cached() {
        let (executor, tool, calls) = setup("delete_task", |_| Ok(json!({"deleted": true})));
        let cancel = CancellationToken::new();
        let call = ToolCall::new("delete_task", json!({"status": "x"}));
        executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        executor.execute_tool(&tool, &call, "u1", true, &cancel).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tool_error_and_panic_are_contained() {
        let (executor, tool, _) = setup("get_tasks", |_| Err("backend down".to_string()));
        let cancel = CancellationToken::new();
        let res = executor
            .execute_tool(&tool, &ToolCall::new("get_tasks", json!({"status": "a"})), "u1", true, &cancel)
            .await;
        assert!(!res.success);
        assert_eq!(res.error.as_deref(), Some("backend down"));

        let (executor, tool, _) = setup("get_tasks", |_| panic!("boom"));
        let res = executor
            .execute_tool(&tool, &ToolCall::new("get_tasks", json!({"status": "a"})), "u1", true, &cancel)
            .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_failure() {
        let (executor, _, _) = setup("get_tasks", |a| Ok(a));
        let res = executor
            .execute_call(&ToolCall::new("nope", json!({})), "u1", true, &CancellationToken::new())
            .await;
        assert!(!res.success);
        assert!(res.error.unwrap().contains("Unknown tool"));
    }

    #[test]
    fn test_normalize_parameters() {
        assert_eq!(normalize_parameters(&json!("text")), json!({}));
        assert_eq!(normalize_parameters(&Value::Null), json!({}));
        assert_eq!(normalize_parameters(&json!([1])), json!([1]));
        assert_eq!(normalize_parameters(&json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_error_shaped_results() {
        let ok = ToolExecution::ok("t", json!({"items": []}), 1, false);
        assert!(ok.is_clean_success());
        let shaped = ToolExecution::ok("t", json!({"error": "not found"}), 1, false);
        assert!(shaped.is_error_shaped());
        let flagged = ToolExecution::ok("t", json!({"success": false}), 1, false);
        assert!(!flagged.is_clean_success());
    }
}
