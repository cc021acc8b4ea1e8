//! Task / Step：一次智能体运行及其有序步骤
//!
//! Step 只由 Planner 在计划校验时创建，只由 Orchestrator 在执行时修改；
//! Task.progress 是派生值（已完成步数 / 总步数），每步结束后重算，从不单独设置。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::CapabilityMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// 一次计划中的工具调用
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub description: String,
    pub tool_name: String,
    pub parameters: Value,
    pub status: StepStatus,
    pub requires_approval: bool,
    pub approved: bool,
    /// 非关键步骤失败不会中止任务
    pub critical: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        tool_name: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            tool_name: tool_name.into(),
            parameters,
            status: StepStatus::Pending,
            requires_approval: false,
            approved: false,
            critical: true,
            result: None,
            error: None,
        }
    }

    pub fn with_approval(mut self, requires_approval: bool) -> Self {
        self.requires_approval = requires_approval;
        self
    }

    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    /// 需要审批但尚未批准
    pub fn awaiting_approval(&self) -> bool {
        self.requires_approval && !self.approved
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status, StepStatus::Completed | StepStatus::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Planning,
    Executing,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 一次端到端的智能体运行
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub mode: CapabilityMode,
    pub steps: Vec<Step>,
    pub status: TaskStatus,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(description: impl Into<String>, mode: CapabilityMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            mode,
            steps: Vec::new(),
            status: TaskStatus::Planning,
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == id)
    }

    /// 第一个尚未结束的步骤
    pub fn next_unsettled(&self) -> Option<usize> {
        self.steps.iter().position(|s| !s.is_settled())
    }

    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    pub fn has_critical_failure(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.critical && s.status == StepStatus::Failed)
    }

    pub fn recompute_progress(&mut self) {
        let total = self.steps.len();
        self.progress = if total == 0 {
            0
        } else {
            ((self.completed_steps() * 100) / total) as u8
        };
    }

    /// 进入终态并记录结束时间
    pub fn finish(&mut self, status: TaskStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
        if status == TaskStatus::Completed {
            self.progress = 100;
        }
    }
}
