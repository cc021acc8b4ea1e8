//! 运行时错误分类与对外失败报告
//!
//! RuntimeError 对应六类失败（状态守卫、能力、需审批、校验、执行、后端）外加协作式取消；
//! TaskFailure 是交给调用方的失败对象：错误分类、最后一个正常状态、（执行错误时）回滚结果。

use serde::Serialize;
use thiserror::Error;

use crate::core::{RuntimeState, Task};
use crate::llm::LlmError;

/// 单步回滚的尝试情况
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub succeeded: bool,
    pub detail: Option<String>,
}

impl RollbackOutcome {
    pub fn not_attempted(detail: impl Into<String>) -> Self {
        Self {
            attempted: false,
            succeeded: false,
            detail: Some(detail.into()),
        }
    }

    pub fn succeeded() -> Self {
        Self {
            attempted: true,
            succeeded: true,
            detail: None,
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            attempted: true,
            succeeded: false,
            detail: Some(detail.into()),
        }
    }
}

/// 错误分类标签
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    StateGuard,
    Capability,
    ApprovalRequired,
    Validation,
    Execution,
    Backend,
    Cancelled,
}

#[derive(Error, Debug)]
pub enum RuntimeError {
    /// 在错误的生命周期状态下调用；从不重试
    #[error("{operation} not allowed in state {state:?}")]
    StateGuard {
        operation: String,
        state: RuntimeState,
    },

    /// 当前模式不允许该工具或副作用
    #[error("Capability denied: {0}")]
    Capability(String),

    /// 步骤需要人工批准（暂停而非失败）
    #[error("Approval required for {tool}")]
    ApprovalRequired { tool: String },

    /// 参数或计划结构不合法
    #[error("Validation failed: {0}")]
    Validation(String),

    /// 工具执行失败，已尝试单步回滚
    #[error("Tool {tool} failed: {message}")]
    Execution {
        tool: String,
        message: String,
        rollback: RollbackOutcome,
    },

    /// 整条后端回退链都失败
    #[error("Backend failure: {0}")]
    Backend(#[from] LlmError),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::StateGuard { .. } => ErrorKind::StateGuard,
            RuntimeError::Capability(_) => ErrorKind::Capability,
            RuntimeError::ApprovalRequired { .. } => ErrorKind::ApprovalRequired,
            RuntimeError::Validation(_) => ErrorKind::Validation,
            RuntimeError::Execution { .. } => ErrorKind::Execution,
            RuntimeError::Backend(_) => ErrorKind::Backend,
            RuntimeError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    pub fn state_guard(operation: impl Into<String>, state: RuntimeState) -> Self {
        RuntimeError::StateGuard {
            operation: operation.into(),
            state,
        }
    }

    pub fn rollback(&self) -> Option<&RollbackOutcome> {
        match self {
            RuntimeError::Execution { rollback, .. } => Some(rollback),
            _ => None,
        }
    }
}

/// 调用方看到的失败：分类、最后正常状态、失败时的任务快照
#[derive(Error, Debug)]
#[error("{error} (last good state: {last_good_state:?})")]
pub struct TaskFailure {
    #[source]
    pub error: RuntimeError,
    pub last_good_state: RuntimeState,
    pub task: Option<Box<Task>>,
}

impl TaskFailure {
    pub fn new(error: RuntimeError, last_good_state: RuntimeState, task: Option<Task>) -> Self {
        Self {
            error,
            last_good_state,
            task: task.map(Box::new),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        let err = RuntimeError::state_guard("start_agent", RuntimeState::Idle);
        assert_eq!(err.kind(), ErrorKind::StateGuard);
        assert!(err.to_string().contains("Idle"));

        let err = RuntimeError::from(LlmError::Api("boom".into()));
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[test]
    fn test_execution_error_carries_rollback() {
        let err = RuntimeError::Execution {
            tool: "runCommand".into(),
            message: "exit 1".into(),
            rollback: RollbackOutcome::failed("inverse failed"),
        };
        let rollback = err.rollback().unwrap();
        assert!(rollback.attempted);
        assert!(!rollback.succeeded);

        let failure = TaskFailure::new(err, RuntimeState::RunningTool, None);
        assert_eq!(failure.kind(), ErrorKind::Execution);
        assert!(failure.to_string().contains("RunningTool"));
    }
}
