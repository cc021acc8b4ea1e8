//! 任务编排：start_agent → 规划 → 校验 → 逐步执行 → 验证
//!
//! 同一时刻只有一个活动任务，互斥由状态机保证（Ready 才能开始），第二个请求直接以 StateGuard 拒绝。
//! 需要审批的步骤会让编排器停在 AwaitingApproval 并返回，调用方记录批准后调用 resume 继续；
//! 关键步骤失败时回滚本任务记录的全部回滚项，任务失败，全局状态停在 Error。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::core::{
    CapabilityMode, ModeStore, Planner, RuntimeError, RuntimeState, SessionSupervisor,
    StateMachine, StepStatus, Task, TaskFailure, TaskStatus,
};
use crate::tools::{ToolContext, ToolExecutor};

#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// 步间延迟，仅用于 UI 反馈
    pub inter_step_delay: Duration,
    /// 审批等待上限；None 表示无限等待
    pub approval_timeout: Option<Duration>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            inter_step_delay: Duration::from_millis(50),
            approval_timeout: None,
        }
    }
}

struct ActiveTask {
    task: Task,
    /// 任务开始时的回滚栈深度
    rollback_mark: usize,
    cancel: CancellationToken,
    awaiting_since: Option<Instant>,
}

pub struct TaskOrchestrator {
    state: Arc<StateMachine>,
    executor: Arc<ToolExecutor>,
    planner: Planner,
    supervisor: SessionSupervisor,
    config: OrchestratorConfig,
    mode_store: Option<Arc<dyn ModeStore>>,
    slot: Mutex<Option<ActiveTask>>,
}

impl TaskOrchestrator {
    pub fn new(state: Arc<StateMachine>, executor: Arc<ToolExecutor>, planner: Planner) -> Self {
        Self {
            state,
            executor,
            planner,
            supervisor: SessionSupervisor::new(),
            config: OrchestratorConfig::default(),
            mode_store: None,
            slot: Mutex::new(None),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_mode_store(mut self, store: Arc<dyn ModeStore>) -> Self {
        self.mode_store = Some(store);
        self
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn current_task(&self) -> Option<Task> {
        self.state.current_task()
    }

    pub fn progress(&self) -> u8 {
        self.state.progress()
    }

    pub fn has_active_task(&self) -> bool {
        self.state
            .current_task()
            .is_some_and(|t| t.is_active())
    }

    fn guard_failure(&self, operation: &str) -> TaskFailure {
        let current = self.state.state();
        TaskFailure::new(RuntimeError::state_guard(operation, current), current, None)
    }

    /// 开始一个任务。返回时任务要么已结束（Completed），要么停在等待审批（Executing）。
    pub async fn start_agent(
        &self,
        description: &str,
        mode: CapabilityMode,
    ) -> Result<Task, TaskFailure> {
        if self.state.state() != RuntimeState::Ready || self.has_active_task() {
            return Err(self.guard_failure("start_agent"));
        }
        let Ok(mut slot) = self.slot.try_lock() else {
            return Err(self.guard_failure("start_agent"));
        };
        // 不能自动执行的模式不切换全局模式，任务随后以 Capability 失败
        if mode.can_auto_execute() && self.state.mode() != mode {
            self.set_mode(mode).map_err(|error| {
                let current = self.state.state();
                TaskFailure::new(error, current, None)
            })?;
        }

        let task = Task::new(description, mode);
        if !self.state.transition_with_task(
            RuntimeState::ProposingActions,
            format!("start task: {description}"),
            task.clone(),
        ) {
            return Err(self.guard_failure("start_agent"));
        }
        tracing::info!(task_id = %task.id, mode = %mode, "task started");
        let active = slot.insert(ActiveTask {
            task,
            rollback_mark: self.executor.rollback_depth(),
            cancel: self.supervisor.begin_task(),
            awaiting_since: None,
        });

        if !mode.can_auto_execute() {
            let error = RuntimeError::Capability(format!(
                "mode '{mode}' cannot auto-execute tasks; switch to agent mode"
            ));
            return Err(self.fail(active, error, RuntimeState::ProposingActions));
        }

        let plan = tokio::select! {
            _ = active.cancel.cancelled() => None,
            plan = self.planner.decompose(description, mode, self.executor.registry()) => Some(plan),
        };
        let steps = match plan {
            None => return Err(self.finish_cancelled(active, "cancelled during planning")),
            Some(Ok(steps)) => steps,
            Some(Err(error)) => return Err(self.fail(active, error, RuntimeState::ProposingActions)),
        };
        tracing::info!(task_id = %active.task.id, steps = steps.len(), "plan validated");
        active.task.steps = steps;
        active.task.recompute_progress();

        self.run_steps(active).await
    }

    /// 记录对某一步的批准；不自动继续执行
    pub async fn approve_step(&self, step_id: &str) -> Result<Task, RuntimeError> {
        let Ok(mut slot) = self.slot.try_lock() else {
            return Err(RuntimeError::state_guard("approve_step", self.state.state()));
        };
        let Some(active) = slot.as_mut().filter(|a| a.task.is_active()) else {
            return Err(RuntimeError::state_guard("approve_step", self.state.state()));
        };
        if self.approval_expired(active) {
            let failure = self.finish_cancelled(active, "approval expired");
            return Err(failure.error);
        }
        let step = active
            .task
            .step_mut(step_id)
            .ok_or_else(|| RuntimeError::Validation(format!("Unknown step: {step_id}")))?;
        if step.status != StepStatus::Pending {
            return Err(RuntimeError::Validation(format!(
                "step {step_id} is not pending"
            )));
        }
        step.approved = true;
        tracing::info!(task_id = %active.task.id, step_id = %step_id, "step approved");
        self.sync(active);
        Ok(active.task.clone())
    }

    /// 拒绝某一步：关键步骤取消整个任务；非关键步骤标记失败，resume 后继续
    pub async fn reject_step(&self, step_id: &str) -> Result<Task, TaskFailure> {
        let Ok(mut slot) = self.slot.try_lock() else {
            return Err(self.guard_failure("reject_step"));
        };
        let Some(active) = slot.as_mut().filter(|a| a.task.is_active()) else {
            return Err(self.guard_failure("reject_step"));
        };
        let Some(step) = active.task.step_mut(step_id) else {
            let current = self.state.state();
            return Err(TaskFailure::new(
                RuntimeError::Validation(format!("Unknown step: {step_id}")),
                current,
                Some(active.task.clone()),
            ));
        };
        if step.critical {
            tracing::info!(step_id = %step_id, "critical step rejected");
            return Err(self.finish_cancelled(active, &format!("step {step_id} rejected")));
        }
        step.status = StepStatus::Failed;
        step.error = Some("rejected by user".to_string());
        tracing::info!(task_id = %active.task.id, step_id = %step_id, "non-critical step rejected");
        self.sync(active);
        Ok(active.task.clone())
    }

    /// 审批后继续执行
    pub async fn resume(&self) -> Result<Task, TaskFailure> {
        let Ok(mut slot) = self.slot.try_lock() else {
            return Err(self.guard_failure("resume"));
        };
        let Some(active) = slot.as_mut().filter(|a| a.task.is_active()) else {
            return Err(self.guard_failure("resume"));
        };
        if self.state.state() != RuntimeState::AwaitingApproval {
            return Err(self.guard_failure("resume"));
        }
        if self.approval_expired(active) {
            return Err(self.finish_cancelled(active, "approval expired"));
        }
        self.run_steps(active).await
    }

    /// 取消当前任务。执行中时在步间生效；等待审批时立即生效。
    pub async fn cancel_agent(&self) -> bool {
        let signalled = self.supervisor.cancel_task();
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(active) = slot.as_mut().filter(|a| a.task.is_active()) {
                self.finish_cancelled(active, "cancelled by user");
                return true;
            }
        }
        signalled
    }

    /// 等待审批超时则取消任务
    pub async fn expire_stale_approval(&self) -> bool {
        let Ok(mut slot) = self.slot.try_lock() else {
            return false;
        };
        match slot.as_mut().filter(|a| a.task.is_active()) {
            Some(active) if self.approval_expired(active) => {
                self.finish_cancelled(active, "approval expired");
                true
            }
            _ => false,
        }
    }

    /// 切换模式；任务进行中拒绝
    pub fn set_mode(&self, mode: CapabilityMode) -> Result<(), RuntimeError> {
        if !self.state.set_mode(mode) {
            return Err(RuntimeError::state_guard("set_mode", self.state.state()));
        }
        if let Some(store) = &self.mode_store {
            if let Err(e) = store.save(mode) {
                tracing::warn!(error = %e, "failed to persist mode");
            }
        }
        Ok(())
    }

    /// 从终态（Completed / Error / Cancelled）回到 Ready
    pub fn reset(&self) -> bool {
        self.state.state().is_terminal()
            && self.state.transition(RuntimeState::Ready, "reset")
    }

    pub fn shutdown(&self) {
        self.supervisor.shutdown();
    }

    fn approval_expired(&self, active: &ActiveTask) -> bool {
        match (self.config.approval_timeout, active.awaiting_since) {
            (Some(limit), Some(since)) => since.elapsed() >= limit,
            _ => false,
        }
    }

    fn sync(&self, active: &ActiveTask) {
        self.state.set_current_task(Some(active.task.clone()));
    }

    /// 终态迁移与已结束的任务一起发布；迁移被拒绝时仍同步任务
    fn settle(&self, active: &ActiveTask, next: RuntimeState, reason: &str) {
        if !self
            .state
            .transition_with_task(next, reason, active.task.clone())
        {
            self.sync(active);
        }
    }

    /// 进入 RunningTool；任务状态与全局状态在同一事件中切到 executing
    fn ensure_running(&self, active: &mut ActiveTask) -> Result<(), TaskFailure> {
        if self.state.state() == RuntimeState::RunningTool {
            return Ok(());
        }
        let previous = active.task.status;
        active.task.status = TaskStatus::Executing;
        if self.state.transition_with_task(
            RuntimeState::RunningTool,
            "executing plan",
            active.task.clone(),
        ) {
            Ok(())
        } else {
            active.task.status = previous;
            let current = self.state.state();
            Err(self.fail(
                active,
                RuntimeError::state_guard("run step", current),
                current,
            ))
        }
    }

    async fn run_steps(&self, active: &mut ActiveTask) -> Result<Task, TaskFailure> {
        while let Some(index) = active.task.next_unsettled() {
            if active.cancel.is_cancelled() {
                return Err(self.finish_cancelled(active, "cancelled by user"));
            }

            let step = &active.task.steps[index];
            if step.awaiting_approval() {
                let step_id = step.id.clone();
                if self.state.state() == RuntimeState::AwaitingApproval {
                    self.sync(active);
                } else {
                    let previous = active.task.status;
                    active.task.status = TaskStatus::Executing;
                    if !self.state.transition_with_task(
                        RuntimeState::AwaitingApproval,
                        format!("step {step_id} needs approval"),
                        active.task.clone(),
                    ) {
                        active.task.status = previous;
                        let current = self.state.state();
                        return Err(self.fail(
                            active,
                            RuntimeError::state_guard("await approval", current),
                            current,
                        ));
                    }
                }
                active.awaiting_since.get_or_insert_with(Instant::now);
                tracing::info!(task_id = %active.task.id, step_id = %step_id, "awaiting approval");
                return Ok(active.task.clone());
            }
            active.awaiting_since = None;
            self.ensure_running(active)?;

            let step = &mut active.task.steps[index];
            step.status = StepStatus::Running;
            let (tool, params, approved) =
                (step.tool_name.clone(), step.parameters.clone(), step.approved);
            self.sync(active);

            let ctx = ToolContext::new()
                .approved(approved)
                .with_cancel(active.cancel.child_token());
            let result = self.executor.execute_step(&tool, &params, &ctx).await;

            let step = &mut active.task.steps[index];
            let step_id = step.id.clone();
            let critical = step.critical;
            let error = match result {
                Ok(outcome) if outcome.success => {
                    step.status = StepStatus::Completed;
                    step.result = outcome.data;
                    tracing::info!(step_id = %step_id, tool = %tool, "step completed");
                    None
                }
                Ok(outcome) => {
                    let message = outcome.error.unwrap_or_else(|| format!("{tool} failed"));
                    step.status = StepStatus::Failed;
                    step.error = Some(message.clone());
                    Some(RuntimeError::Execution {
                        tool: tool.clone(),
                        message,
                        rollback: outcome.rollback.unwrap_or_default(),
                    })
                }
                Err(error) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(error.to_string());
                    Some(error)
                }
            };
            active.task.recompute_progress();
            self.sync(active);

            if active.cancel.is_cancelled() {
                return Err(self.finish_cancelled(active, "cancelled by user"));
            }
            if let Some(error) = error {
                if critical {
                    tracing::warn!(step_id = %step_id, error = %error, "critical step failed");
                    self.rollback_task(active).await;
                    return Err(self.fail(active, error, RuntimeState::RunningTool));
                }
                tracing::warn!(step_id = %step_id, error = %error, "non-critical step failed, continuing");
            }

            if active.task.next_unsettled().is_some() && !self.config.inter_step_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.inter_step_delay) => {}
                    _ = active.cancel.cancelled() => {}
                }
            }
        }

        self.verify(active)
    }

    fn verify(&self, active: &mut ActiveTask) -> Result<Task, TaskFailure> {
        self.ensure_running(active)?;
        active.task.status = TaskStatus::Verifying;
        if !self.state.transition_with_task(
            RuntimeState::Verifying,
            "all steps settled",
            active.task.clone(),
        ) {
            active.task.status = TaskStatus::Executing;
            let current = self.state.state();
            return Err(self.fail(active, RuntimeError::state_guard("verify", current), current));
        }

        if active.task.has_critical_failure() {
            let error = RuntimeError::Validation("a critical step did not complete".to_string());
            return Err(self.fail(active, error, RuntimeState::Verifying));
        }

        active.task.finish(TaskStatus::Completed);
        self.settle(active, RuntimeState::Completed, "task completed");
        self.supervisor.end_task();
        tracing::info!(
            task_id = %active.task.id,
            steps = active.task.steps.len(),
            completed = active.task.completed_steps(),
            "task completed"
        );
        Ok(active.task.clone())
    }

    /// 逆序重放本任务记录的全部回滚项
    async fn rollback_task(&self, active: &ActiveTask) {
        let mut undone = 0usize;
        let mut failed = 0usize;
        while self.executor.rollback_depth() > active.rollback_mark {
            if self.executor.rollback_last_step().await {
                undone += 1;
            } else {
                failed += 1;
            }
        }
        if failed > 0 {
            tracing::warn!(task_id = %active.task.id, undone, failed, "task rollback incomplete");
        } else {
            tracing::info!(task_id = %active.task.id, undone, "task rolled back");
        }
    }

    fn fail(
        &self,
        active: &mut ActiveTask,
        error: RuntimeError,
        last_good_state: RuntimeState,
    ) -> TaskFailure {
        active.task.finish(TaskStatus::Failed);
        active.awaiting_since = None;
        self.settle(active, RuntimeState::Error, &error.to_string());
        self.supervisor.end_task();
        tracing::error!(task_id = %active.task.id, kind = ?error.kind(), error = %error, "task failed");
        TaskFailure::new(error, last_good_state, Some(active.task.clone()))
    }

    fn finish_cancelled(&self, active: &mut ActiveTask, reason: &str) -> TaskFailure {
        let last_good_state = self.state.state();
        active.task.finish(TaskStatus::Cancelled);
        active.awaiting_since = None;
        self.settle(active, RuntimeState::Cancelled, reason);
        self.supervisor.end_task();
        tracing::info!(task_id = %active.task.id, reason = %reason, "task cancelled");
        TaskFailure::new(
            RuntimeError::Cancelled(reason.to_string()),
            last_good_state,
            Some(active.task.clone()),
        )
    }
}
