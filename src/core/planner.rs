//! Planner：任务分解与计划校验
//!
//! decompose 把任务描述、当前模式允许的工具及计划 schema 交给模型；
//! validate_plan 严格解析模型输出。模型输出按不可信输入对待：
//! 未注册的工具名是 Validation 错误，模式不允许的工具是 Capability 错误，绝不尝试执行。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::{CapabilityMode, RuntimeError, Step};
use crate::llm::{ChatOptions, Message, RequestRouter};
use crate::tools::{plan_schema_json, ToolRegistry};

const PLANNER_SYSTEM_PROMPT: &str = "You are the planning component of a coding agent. \
Break the user's task into the smallest sequence of tool calls that accomplishes it. \
Use only the tools listed below, with parameters that satisfy each tool's schema. \
Reply with JSON only: an object {\"steps\": [...]} matching the plan schema. No prose.";

pub struct Planner {
    router: Arc<RequestRouter>,
    options: ChatOptions,
}

impl Planner {
    pub fn new(router: Arc<RequestRouter>) -> Self {
        Self {
            router,
            options: ChatOptions {
                temperature: Some(0.0),
                ..ChatOptions::default()
            },
        }
    }

    pub fn with_options(mut self, options: ChatOptions) -> Self {
        self.options = options;
        self
    }

    /// 规划请求：系统约束（模式、可用工具、schema）+ 任务描述
    pub fn plan_messages(
        &self,
        description: &str,
        mode: CapabilityMode,
        registry: &ToolRegistry,
    ) -> Vec<Message> {
        let policy = mode.policy();
        let system = format!(
            "{PLANNER_SYSTEM_PROMPT}\n\nMode: {mode}\nAllowed effects: {}\n\nAvailable tools:\n{}\n\nPlan schema:\n{}",
            policy.effects.describe().join(", "),
            registry.to_schema_json(&policy),
            plan_schema_json(),
        );
        vec![Message::system(system), Message::user(description)]
    }

    pub async fn decompose(
        &self,
        description: &str,
        mode: CapabilityMode,
        registry: &ToolRegistry,
    ) -> Result<Vec<Step>, RuntimeError> {
        let messages = self.plan_messages(description, mode, registry);
        let response = self.router.chat(&messages, &self.options).await?;
        tracing::debug!(backend = %response.backend, chars = response.content.len(), "plan received");
        validate_plan(&response.content, mode, registry)
    }
}

/// 去掉包裹整个回复的 ``` / ```json 代码块
fn strip_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(body) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(body) = body.strip_suffix("```") else {
        return trimmed;
    };
    let body = body.strip_prefix("json").unwrap_or(body);
    body.trim()
}

fn required_str(obj: &Map<String, Value>, key: &str, index: usize) -> Result<String, RuntimeError> {
    match obj.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) if key == "id" => Ok(n.to_string()),
        _ => Err(RuntimeError::Validation(format!(
            "step {index}: missing or invalid '{key}'"
        ))),
    }
}

fn optional_bool(
    obj: &Map<String, Value>,
    key: &str,
    index: usize,
) -> Result<Option<bool>, RuntimeError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(RuntimeError::Validation(format!(
            "step {index}: '{key}' must be a boolean"
        ))),
    }
}

/// 严格解析并校验计划。接受顶层数组或 {"steps": [...]}；任何一步不合法则整个计划被拒绝。
pub fn validate_plan(
    raw: &str,
    mode: CapabilityMode,
    registry: &ToolRegistry,
) -> Result<Vec<Step>, RuntimeError> {
    let envelope: Value = serde_json::from_str(strip_fence(raw))
        .map_err(|e| RuntimeError::Validation(format!("plan is not valid JSON: {e}")))?;
    let entries = match envelope {
        Value::Array(entries) => entries,
        Value::Object(mut obj) => match obj.remove("steps") {
            Some(Value::Array(entries)) => entries,
            _ => {
                return Err(RuntimeError::Validation(
                    "plan object must contain a 'steps' array".to_string(),
                ))
            }
        },
        _ => {
            return Err(RuntimeError::Validation(
                "plan must be an array of steps".to_string(),
            ))
        }
    };
    if entries.is_empty() {
        return Err(RuntimeError::Validation("plan contains no steps".to_string()));
    }

    let policy = mode.policy();
    let mut seen = HashSet::new();
    let mut steps = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let Value::Object(obj) = entry else {
            return Err(RuntimeError::Validation(format!(
                "step {index} is not an object"
            )));
        };
        let id = required_str(&obj, "id", index)?;
        if !seen.insert(id.clone()) {
            return Err(RuntimeError::Validation(format!("duplicate step id '{id}'")));
        }
        let description = required_str(&obj, "description", index)?;
        let tool_name = required_str(&obj, "toolName", index)?;
        let parameters = match obj.get("parameters") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(Value::Object(p)) => Value::Object(p.clone()),
            Some(_) => {
                return Err(RuntimeError::Validation(format!(
                    "step {id}: 'parameters' must be an object"
                )))
            }
        };
        let requires_approval = optional_bool(&obj, "requiresApproval", index)?.unwrap_or(false);
        let critical = optional_bool(&obj, "critical", index)?.unwrap_or(true);

        let definition = registry.resolve(&tool_name)?;
        registry.check_capability(definition, &policy)?;
        definition
            .validate_params(&parameters)
            .map_err(|e| RuntimeError::Validation(format!("step {id}: {e}")))?;

        steps.push(
            Step::new(id, description, tool_name, parameters)
                .with_approval(requires_approval || definition.requires_approval)
                .with_critical(critical),
        );
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorKind;
    use crate::llm::{Backend, MockLlmClient, StaticKeyLookup};
    use crate::tools::{CreateFileTool, EditFileTool, ReadFileTool, SafeFs};

    fn registry() -> ToolRegistry {
        let fs = SafeFs::new(std::env::temp_dir());
        let mut registry = ToolRegistry::new();
        registry.register(ReadFileTool::new(fs.clone())).unwrap();
        registry.register(CreateFileTool::new(fs.clone())).unwrap();
        registry.register(EditFileTool::new(fs)).unwrap();
        registry
    }

    #[test]
    fn test_accepts_array_object_and_fenced_plans() {
        let registry = registry();
        let array = r#"[{"id":"1","description":"read","toolName":"readFile","parameters":{"path":"a"}}]"#;
        let object = format!(r#"{{"steps": {array}}}"#);
        let fenced = format!("```json\n{object}\n```");
        for raw in [array.to_string(), object, fenced] {
            let steps = validate_plan(&raw, CapabilityMode::Agent, &registry).unwrap();
            assert_eq!(steps.len(), 1);
            assert_eq!(steps[0].tool_name, "readFile");
            assert!(steps[0].critical);
            assert!(!steps[0].requires_approval);
        }
    }

    #[test]
    fn test_unknown_tool_rejected_as_validation() {
        let raw = r#"{"steps":[{"id":"1","description":"x","toolName":"delete_universe","parameters":{}}]}"#;
        let err = validate_plan(raw, CapabilityMode::Agent, &registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("delete_universe"));
    }

    #[test]
    fn test_mode_disallowed_tool_is_capability_error() {
        let raw = r#"[{"id":"1","description":"x","toolName":"createFile","parameters":{"path":"a","content":""}}]"#;
        let err = validate_plan(raw, CapabilityMode::Ask, &registry()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Capability);
    }

    #[test]
    fn test_structural_errors() {
        let registry = registry();
        let cases = [
            "not json",
            "[]",
            r#"{"plan": []}"#,
            r#"["readFile"]"#,
            r#"[{"id":"1","toolName":"readFile","parameters":{"path":"a"}}]"#,
            r#"[{"id":"1","description":"d","toolName":"readFile","parameters":"a"}]"#,
            r#"[{"id":"1","description":"d","toolName":"readFile","parameters":{}}]"#,
            r#"[{"id":"1","description":"d","toolName":"readFile","parameters":{"path":"a"},"critical":"no"}]"#,
            r#"[{"id":"1","description":"d","toolName":"readFile","parameters":{"path":"a"}},
                {"id":"1","description":"d","toolName":"readFile","parameters":{"path":"b"}}]"#,
        ];
        for raw in cases {
            let err = validate_plan(raw, CapabilityMode::Agent, &registry).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "case: {raw}");
        }
    }

    #[test]
    fn test_tool_approval_policy_is_forced_on() {
        let raw = r#"[{"id":"1","description":"edit","toolName":"editFile","requiresApproval":false,"critical":false,
            "parameters":{"path":"a","old_string":"x","new_string":"y"}}]"#;
        let steps = validate_plan(raw, CapabilityMode::Agent, &registry()).unwrap();
        assert!(steps[0].requires_approval);
        assert!(!steps[0].approved);
        assert!(!steps[0].critical);
    }

    #[tokio::test]
    async fn test_decompose_prompts_with_allowed_tools_only() {
        let mock = Arc::new(MockLlmClient::new().with_reply(
            r#"{"steps":[{"id":"1","description":"read","toolName":"readFile","parameters":{"path":"a"}}]}"#,
        ));
        let mut router = RequestRouter::new(Arc::new(StaticKeyLookup::new().with_key("mock", "k")));
        router.add_backend(Backend::new("mock", "mock-model", mock.clone()));
        let planner = Planner::new(Arc::new(router));

        let steps = planner
            .decompose("show a", CapabilityMode::Ask, &registry())
            .await
            .unwrap();
        assert_eq!(steps.len(), 1);

        let request = mock.last_request().unwrap();
        let system = &request.messages[0].content;
        assert!(system.contains("readFile"));
        assert!(!system.contains("createFile"));
        assert_eq!(request.messages[1].content, "show a");
    }
}
