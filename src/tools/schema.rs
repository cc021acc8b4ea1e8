//! 计划格式的 JSON Schema（schemars 自动生成）
//!
//! 注入规划 prompt，约束模型输出的步骤结构，减少格式错误。

use std::collections::HashMap;

use schemars::{schema_for, JsonSchema};
use serde::Deserialize;

/// 模型输出的计划信封：`{"steps": [...]}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
struct PlanFormat {
    pub steps: Vec<PlanStepFormat>,
}

#[allow(dead_code)]
#[derive(Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
struct PlanStepFormat {
    /// 计划内唯一的步骤 id，如 "1"、"2"
    pub id: String,
    /// 这一步做什么
    pub description: String,
    /// 必须是可用工具列表中的名字
    pub tool_name: String,
    /// 工具参数，需满足该工具的 parameters schema
    pub parameters: HashMap<String, serde_json::Value>,
    /// 是否需要人工批准（工具自身要求审批时总是需要）
    pub requires_approval: Option<bool>,
    /// 失败是否中止整个任务，默认 true
    pub critical: Option<bool>,
}

/// 返回计划的 JSON Schema 字符串，可拼入 system prompt
pub fn plan_schema_json() -> String {
    let schema = schema_for!(PlanFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_else(|_| String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_uses_camel_case_fields() {
        let schema = plan_schema_json();
        assert!(schema.contains("toolName"));
        assert!(schema.contains("requiresApproval"));
        assert!(!schema.contains("tool_name"));
    }
}
