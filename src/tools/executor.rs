//! 工具执行器
//!
//! 每次调用依次通过六道检查：运行时状态、（独立调用时）Ready → RunningTool、工具存在、
//! 模式许可、审批、参数；之后在可选超时内执行，输出结构化审计日志（JSON）。
//! 成功的可回滚调用压入回滚栈；失败时尽力回滚本步并在结果中报告回滚情况。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::{RollbackOutcome, RuntimeError, RuntimeState, StateMachine};
use crate::tools::{RollbackEntry, RollbackStack, Tool, ToolContext, ToolDefinition, ToolRegistry};

/// 单次工具调用结果
#[derive(Clone, Debug)]
pub struct ToolOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub duration: Duration,
    /// 仅在失败时填写
    pub rollback: Option<RollbackOutcome>,
}

impl ToolOutcome {
    fn ok(data: Value, duration: Duration) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            duration,
            rollback: None,
        }
    }

    fn failed(error: String, duration: Duration, rollback: RollbackOutcome) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            duration,
            rollback: Some(rollback),
        }
    }
}

/// 工具执行器：共享注册表、状态机与回滚栈
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    state: Arc<StateMachine>,
    rollback: RollbackStack,
    timeout: Option<Duration>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, state: Arc<StateMachine>) -> Self {
        Self {
            registry,
            state,
            rollback: RollbackStack::new(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn rollback_depth(&self) -> usize {
        self.rollback.len()
    }

    pub fn rollback_entries(&self) -> Vec<RollbackEntry> {
        self.rollback.entries()
    }

    /// 独立调用：要求 Ready，结束后经 Completed / Error 回到 Ready
    pub async fn execute(
        &self,
        name: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, RuntimeError> {
        let current = self.state.state();
        if current != RuntimeState::Ready {
            return Err(RuntimeError::state_guard("execute tool", current));
        }
        if !self
            .state
            .transition(RuntimeState::RunningTool, format!("run tool {name}"))
        {
            return Err(RuntimeError::state_guard("execute tool", self.state.state()));
        }

        let result = self.run_gated(name, params, ctx).await;

        let (next, reason) = match &result {
            Ok(outcome) if outcome.success => (RuntimeState::Completed, format!("{name} succeeded")),
            Ok(outcome) => (
                RuntimeState::Error,
                outcome.error.clone().unwrap_or_else(|| format!("{name} failed")),
            ),
            Err(e) => (RuntimeState::Error, e.to_string()),
        };
        self.state.transition(next, reason);
        self.state.transition(RuntimeState::Ready, "standalone tool call settled");
        result
    }

    /// 任务内调用：状态必须已是 RunningTool，状态推进由编排器负责
    pub async fn execute_step(
        &self,
        name: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, RuntimeError> {
        let current = self.state.state();
        if current != RuntimeState::RunningTool {
            return Err(RuntimeError::state_guard("execute step", current));
        }
        self.run_gated(name, params, ctx).await
    }

    async fn run_gated(
        &self,
        name: &str,
        params: &Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutcome, RuntimeError> {
        let definition = self.registry.resolve(name)?.clone();
        self.registry
            .check_capability(&definition, &self.state.mode().policy())?;
        if definition.requires_approval && !ctx.approved {
            return Err(RuntimeError::ApprovalRequired {
                tool: name.to_string(),
            });
        }
        definition
            .validate_params(params)
            .map_err(RuntimeError::Validation)?;
        if ctx.cancel.is_cancelled() {
            return Err(RuntimeError::Cancelled(format!("{name} cancelled before start")));
        }
        let tool = self
            .registry
            .get(name)
            .ok_or_else(|| RuntimeError::Validation(format!("Unknown tool: {name}")))?;

        Ok(self.run(&definition, tool, params, ctx).await)
    }

    async fn run(
        &self,
        definition: &ToolDefinition,
        tool: Arc<dyn Tool>,
        params: &Value,
        ctx: &ToolContext,
    ) -> ToolOutcome {
        let name = definition.name.as_str();
        let snapshot = if definition.rollbackable {
            tool.snapshot(params).await
        } else {
            None
        };

        let start = Instant::now();
        let result = match self.timeout {
            Some(limit) => timeout(limit, tool.execute(params, ctx))
                .await
                .unwrap_or_else(|_| Err(format!("{name} timed out after {}s", limit.as_secs()))),
            None => tool.execute(params, ctx).await,
        };
        let duration = start.elapsed();

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": name,
            "ok": result.is_ok(),
            "outcome": if result.is_ok() { "ok" } else { "error" },
            "duration_ms": duration.as_millis() as u64,
            "args_preview": args_preview(params),
            "mode": self.state.mode().as_str(),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(data) => {
                if definition.rollbackable {
                    if let Some(rb) = tool.rollback_data(params, snapshot.as_ref(), Some(&data)) {
                        self.rollback.push(RollbackEntry::new(name, rb));
                    }
                }
                ToolOutcome::ok(data, duration)
            }
            Err(error) => {
                let rollback = if !definition.rollbackable {
                    RollbackOutcome::not_attempted(format!("{name} is not rollbackable"))
                } else {
                    match tool.rollback_data(params, snapshot.as_ref(), None) {
                        None => RollbackOutcome::not_attempted("nothing to roll back"),
                        Some(data) => match tool.rollback(&data).await {
                            Ok(()) => RollbackOutcome::succeeded(),
                            Err(e) => {
                                tracing::warn!(tool = %name, error = %e, "rollback after failure did not complete");
                                RollbackOutcome::failed(e)
                            }
                        },
                    }
                };
                ToolOutcome::failed(error, duration, rollback)
            }
        }
    }

    /// 弹出并重放最近一条回滚记录；栈空或回滚失败返回 false
    pub async fn rollback_last_step(&self) -> bool {
        let Some(entry) = self.rollback.pop() else {
            return false;
        };
        let Some(tool) = self.registry.get(&entry.tool_name) else {
            tracing::warn!(tool = %entry.tool_name, "rollback entry refers to unknown tool");
            return false;
        };
        match tool.rollback(&entry.rollback_data).await {
            Ok(()) => {
                tracing::info!(tool = %entry.tool_name, "rolled back");
                true
            }
            Err(e) => {
                tracing::warn!(tool = %entry.tool_name, error = %e, "rollback failed");
                false
            }
        }
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
