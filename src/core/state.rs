//! 运行时状态机：全进程唯一的生命周期状态
//!
//! RuntimeState 为固定枚举，合法迁移由静态邻接表声明；transition 在单把互斥锁内完成
//! 邻接检查与修改（无撕裂读），成功后追加迁移日志，并在释放锁后按注册顺序同步通知订阅者。
//! 订阅者的错误或 panic 只记录日志，不会影响迁移本身。
//!
//! Completed / Error / Cancelled 只能回到 Ready，这是唯一的重入路径。

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::{CapabilityMode, Task};

/// 运行时生命周期状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum RuntimeState {
    Idle,
    Ready,
    Analyzing,
    Streaming,
    ProposingActions,
    AwaitingApproval,
    RunningTool,
    Verifying,
    Completed,
    Error,
    Cancelled,
}

impl RuntimeState {
    pub const ALL: [RuntimeState; 11] = [
        RuntimeState::Idle,
        RuntimeState::Ready,
        RuntimeState::Analyzing,
        RuntimeState::Streaming,
        RuntimeState::ProposingActions,
        RuntimeState::AwaitingApproval,
        RuntimeState::RunningTool,
        RuntimeState::Verifying,
        RuntimeState::Completed,
        RuntimeState::Error,
        RuntimeState::Cancelled,
    ];

    /// 邻接表：当前状态允许迁往的状态
    pub fn allowed_next(&self) -> &'static [RuntimeState] {
        use RuntimeState as S;
        match self {
            S::Idle => &[S::Ready],
            S::Ready => &[
                S::Analyzing,
                S::Streaming,
                S::ProposingActions,
                S::RunningTool,
                S::Error,
            ],
            S::Analyzing => &[
                S::Streaming,
                S::ProposingActions,
                S::Completed,
                S::Error,
                S::Cancelled,
            ],
            S::Streaming => &[
                S::Analyzing,
                S::ProposingActions,
                S::Completed,
                S::Error,
                S::Cancelled,
            ],
            S::ProposingActions => &[S::AwaitingApproval, S::RunningTool, S::Error, S::Cancelled],
            S::AwaitingApproval => &[S::RunningTool, S::Error, S::Cancelled],
            S::RunningTool => &[
                S::AwaitingApproval,
                S::Verifying,
                S::Completed,
                S::Error,
                S::Cancelled,
            ],
            S::Verifying => &[S::Completed, S::Error, S::Cancelled],
            S::Completed | S::Error | S::Cancelled => &[S::Ready],
        }
    }

    pub fn can_transition_to(&self, next: RuntimeState) -> bool {
        self.allowed_next().contains(&next)
    }

    /// 终态（只能回到 Ready）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RuntimeState::Completed | RuntimeState::Error | RuntimeState::Cancelled
        )
    }
}

/// 迁移日志中的一条记录（只追加）
#[derive(Clone, Debug, Serialize)]
pub struct TransitionRecord {
    pub from: RuntimeState,
    pub to: RuntimeState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// 推送给订阅者（UI、日志、持久化）的状态快照
#[derive(Clone, Debug, Serialize)]
pub struct StateEvent {
    pub state: RuntimeState,
    pub mode: CapabilityMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<Task>,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// 订阅回调；返回 Err 只会被记录
pub type Subscriber = Arc<dyn Fn(&StateEvent) -> Result<(), String> + Send + Sync>;

/// 退订凭证
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
struct StateRecord {
    state: RuntimeState,
    mode: CapabilityMode,
    task: Option<Task>,
    progress: u8,
    last_error: Option<String>,
    log: Vec<TransitionRecord>,
}

impl StateRecord {
    fn event(&self) -> StateEvent {
        StateEvent {
            state: self.state,
            mode: self.mode,
            task: self.task.clone(),
            progress: self.progress,
            last_error: self.last_error.clone(),
        }
    }
}

/// 唯一的状态记录持有者；所有修改经由本结构体的方法
pub struct StateMachine {
    record: Mutex<StateRecord>,
    subscribers: Mutex<Vec<(SubscriptionId, Subscriber)>>,
    next_subscription: AtomicU64,
}

impl StateMachine {
    /// 初始状态为 Idle
    pub fn new(mode: CapabilityMode) -> Self {
        Self {
            record: Mutex::new(StateRecord {
                state: RuntimeState::Idle,
                mode,
                task: None,
                progress: 0,
                last_error: None,
                log: Vec::new(),
            }),
            subscribers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(0),
        }
    }

    fn record(&self) -> MutexGuard<'_, StateRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 尝试迁移到 next；不在邻接表中则拒绝（返回 false、状态不变、记录 last_error）
    pub fn transition(&self, next: RuntimeState, reason: impl Into<String>) -> bool {
        self.apply_transition(next, reason.into(), None)
    }

    /// 迁移并替换任务快照；订阅者在同一个事件里看到新状态与新任务
    pub fn transition_with_task(
        &self,
        next: RuntimeState,
        reason: impl Into<String>,
        task: Task,
    ) -> bool {
        self.apply_transition(next, reason.into(), Some(task))
    }

    fn apply_transition(&self, next: RuntimeState, reason: String, task: Option<Task>) -> bool {
        let event = {
            let mut record = self.record();
            let from = record.state;
            if !from.can_transition_to(next) {
                let msg = format!("Invalid transition {from:?} -> {next:?} ({reason})");
                tracing::warn!(from = ?from, to = ?next, reason = %reason, "transition rejected");
                record.last_error = Some(msg);
                return false;
            }
            // 从 Ready 开始新一轮工作时清除上一轮的错误
            if from == RuntimeState::Ready {
                record.last_error = None;
            }
            if next == RuntimeState::Error {
                record.last_error = Some(reason.clone());
            }
            record.state = next;
            if let Some(task) = task {
                record.progress = task.progress;
                record.task = Some(task);
            }
            record.log.push(TransitionRecord {
                from,
                to: next,
                reason: reason.clone(),
                at: Utc::now(),
            });
            tracing::info!(from = ?from, to = ?next, reason = %reason, "state transition");
            record.event()
        };
        self.notify(&event);
        true
    }

    pub fn state(&self) -> RuntimeState {
        self.record().state
    }

    pub fn mode(&self) -> CapabilityMode {
        self.record().mode
    }

    pub fn last_error(&self) -> Option<String> {
        self.record().last_error.clone()
    }

    pub fn progress(&self) -> u8 {
        self.record().progress
    }

    pub fn current_task(&self) -> Option<Task> {
        self.record().task.clone()
    }

    pub fn snapshot(&self) -> StateEvent {
        self.record().event()
    }

    /// 迁移日志副本
    pub fn history(&self) -> Vec<TransitionRecord> {
        self.record().log.clone()
    }

    pub fn history_len(&self) -> usize {
        self.record().log.len()
    }

    /// 切换能力模式；存在活跃任务时拒绝
    pub fn set_mode(&self, mode: CapabilityMode) -> bool {
        let event = {
            let mut record = self.record();
            if record.task.as_ref().is_some_and(|t| t.is_active()) {
                record.last_error = Some("Cannot switch mode while a task is active".to_string());
                return false;
            }
            record.mode = mode;
            record.event()
        };
        self.notify(&event);
        true
    }

    /// 设置进度（0-100），越界时失败
    pub fn set_progress(&self, progress: u8) -> bool {
        if progress > 100 {
            self.record().last_error = Some(format!("Progress out of range: {progress}"));
            return false;
        }
        let event = {
            let mut record = self.record();
            record.progress = progress;
            record.event()
        };
        self.notify(&event);
        true
    }

    /// 设置当前任务快照，进度随任务同步
    pub fn set_current_task(&self, task: Option<Task>) {
        let event = {
            let mut record = self.record();
            record.progress = task.as_ref().map(|t| t.progress).unwrap_or(0);
            record.task = task;
            record.event()
        };
        self.notify(&event);
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&StateEvent) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// 按注册顺序通知；在状态锁外调用，订阅者可安全回读状态
    fn notify(&self, event: &StateEvent) {
        let subs: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect();
        for sub in subs {
            match catch_unwind(AssertUnwindSafe(|| sub(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "state subscriber failed"),
                Err(_) => tracing::error!("state subscriber panicked"),
            }
        }
    }
}
