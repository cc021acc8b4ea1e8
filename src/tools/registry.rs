//! 工具注册表
//!
//! 所有工具实现 Tool trait（definition / snapshot / execute / rollback_data / rollback），
//! 由 ToolRegistry 按名注册（启动时一次，之后以 Arc 共享、不再修改）。
//! 模型生成的工具名先经 resolve 校验成员资格，再用于查找执行器。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{EffectTag, ModePolicy, RuntimeError};

/// 工具的静态描述：参数 schema、审批要求、可回滚性、副作用标签
#[derive(Clone, Debug, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema（object，带 properties / required）
    pub parameters: Value,
    pub requires_approval: bool,
    pub rollbackable: bool,
    pub effect: EffectTag,
    /// false 表示工具只负责派发，结果在带外观察
    pub blocking: bool,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, effect: EffectTag) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
            requires_approval: false,
            rollbackable: false,
            effect,
            blocking: true,
        }
    }

    pub fn with_parameters(mut self, schema: Value) -> Self {
        self.parameters = schema;
        self
    }

    pub fn requires_approval(mut self) -> Self {
        self.requires_approval = true;
        self
    }

    pub fn rollbackable(mut self) -> Self {
        self.rollbackable = true;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn required_params(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(|r| r.as_array())
            .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// 必填参数存在且非 null；已声明类型的参数类型匹配
    pub fn validate_params(&self, params: &Value) -> Result<(), String> {
        let obj = params
            .as_object()
            .ok_or_else(|| format!("{}: parameters must be a JSON object", self.name))?;
        for key in self.required_params() {
            match obj.get(key) {
                None | Some(Value::Null) => {
                    return Err(format!("{}: missing required parameter '{key}'", self.name))
                }
                Some(_) => {}
            }
        }
        let properties = self.parameters.get("properties").and_then(|p| p.as_object());
        for (key, value) in obj {
            let expected = properties
                .and_then(|p| p.get(key))
                .and_then(|p| p.get("type"))
                .and_then(|t| t.as_str());
            let ok = match expected {
                Some("string") => value.is_string(),
                Some("boolean") => value.is_boolean(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("number") => value.is_number(),
                Some("object") => value.is_object(),
                Some("array") => value.is_array(),
                _ => true,
            };
            if !ok {
                return Err(format!(
                    "{}: parameter '{key}' must be of type {}",
                    self.name,
                    expected.unwrap_or("any")
                ));
            }
        }
        Ok(())
    }
}

/// 进度回调（0-100）
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// 单次调用的上下文：是否已批准、取消信号、进度回调
#[derive(Clone, Default)]
pub struct ToolContext {
    pub approved: bool,
    pub cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl ToolContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn report(&self, percent: u8) {
        if let Some(progress) = &self.progress {
            progress(percent.min(100));
        }
    }
}

/// 工具 trait
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// 执行前采集现场（如文件原内容），交给 rollback_data
    async fn snapshot(&self, _params: &Value) -> Option<Value> {
        None
    }

    async fn execute(&self, params: &Value, ctx: &ToolContext) -> Result<Value, String>;

    /// 回滚数据生成器；result 为 None 表示执行失败
    fn rollback_data(
        &self,
        _params: &Value,
        _snapshot: Option<&Value>,
        _result: Option<&Value>,
    ) -> Option<Value> {
        None
    }

    /// 重放回滚；对已回滚的数据再次调用应为无操作
    async fn rollback(&self, _data: &Value) -> Result<(), String> {
        Err(format!("{} is not rollbackable", self.definition().name))
    }
}

struct Registered {
    definition: ToolDefinition,
    tool: Arc<dyn Tool>,
}

/// 工具注册表：按名称存储定义与执行器
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Registered>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；重名时拒绝
    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), RuntimeError> {
        let definition = tool.definition();
        if self.tools.contains_key(&definition.name) {
            return Err(RuntimeError::Validation(format!(
                "Tool already registered: {}",
                definition.name
            )));
        }
        tracing::debug!(tool = %definition.name, effect = %definition.effect, "tool registered");
        self.tools.insert(
            definition.name.clone(),
            Registered {
                definition,
                tool: Arc::new(tool),
            },
        );
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// 校验工具名属于注册表并返回定义
    pub fn resolve(&self, name: &str) -> Result<&ToolDefinition, RuntimeError> {
        self.tools
            .get(name)
            .map(|r| &r.definition)
            .ok_or_else(|| RuntimeError::Validation(format!("Unknown tool: {name}")))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|r| r.tool.clone())
    }

    pub fn check_capability(
        &self,
        definition: &ToolDefinition,
        policy: &ModePolicy,
    ) -> Result<(), RuntimeError> {
        if policy.permits(&definition.name, definition.effect) {
            Ok(())
        } else {
            Err(RuntimeError::Capability(format!(
                "tool '{}' ({} effect) is not permitted in this mode",
                definition.name, definition.effect
            )))
        }
    }

    /// 工具名（排序，便于 prompt 稳定）
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> =
            self.tools.values().map(|r| r.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// 当前模式下可用工具的 schema JSON（注入规划 prompt）
    pub fn to_schema_json(&self, policy: &ModePolicy) -> String {
        let tools: Vec<Value> = self
            .definitions()
            .into_iter()
            .filter(|d| policy.permits(&d.name, d.effect))
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "description": d.description,
                    "parameters": d.parameters,
                    "effect": d.effect,
                    "requiresApproval": d.requires_approval,
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CapabilityMode;
    use serde_json::json;

    struct SampleTool;

    #[async_trait]
    impl Tool for SampleTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("sample", "test tool", EffectTag::Write).with_parameters(json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "force": {"type": "boolean"}
                },
                "required": ["path"]
            }))
        }

        async fn execute(&self, _params: &Value, _ctx: &ToolContext) -> Result<Value, String> {
            Ok(json!("ok"))
        }
    }

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = ToolRegistry::new();
        registry.register(SampleTool).unwrap();
        let err = registry.register(SampleTool).unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(_)));
    }

    #[test]
    fn test_resolve_unknown_tool_is_validation_error() {
        let registry = ToolRegistry::new();
        let err = registry.resolve("delete_universe").unwrap_err();
        assert!(matches!(err, RuntimeError::Validation(ref m) if m.contains("delete_universe")));
    }

    #[test]
    fn test_validate_params() {
        let def = SampleTool.definition();
        assert!(def.validate_params(&json!({"path": "a.txt"})).is_ok());
        assert!(def.validate_params(&json!({})).is_err());
        assert!(def.validate_params(&json!({"path": null})).is_err());
        assert!(def.validate_params(&json!({"path": 3})).is_err());
        assert!(def.validate_params(&json!({"path": "a", "force": "yes"})).is_err());
        assert!(def.validate_params(&json!("a.txt")).is_err());
    }

    #[test]
    fn test_capability_check_and_schema_filter() {
        let mut registry = ToolRegistry::new();
        registry.register(SampleTool).unwrap();
        let def = registry.resolve("sample").unwrap().clone();
        let ask = CapabilityMode::Ask.policy();
        assert!(matches!(
            registry.check_capability(&def, &ask),
            Err(RuntimeError::Capability(_))
        ));
        assert!(registry
            .check_capability(&def, &CapabilityMode::Agent.policy())
            .is_ok());
        assert_eq!(registry.to_schema_json(&ask), "[]");
        assert!(registry
            .to_schema_json(&CapabilityMode::Agent.policy())
            .contains("sample"));
    }
}
