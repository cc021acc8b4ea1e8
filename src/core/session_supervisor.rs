//! 会话监管：取消管理
//!
//! 持有会话级 CancellationToken（进程退出时取消），每个任务开始时派生子 token；
//! cancel_task 只取消当前任务，shutdown 取消整个会话。

use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct SessionSupervisor {
    session: CancellationToken,
    task: Mutex<Option<CancellationToken>>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新任务派生取消令牌（替换上一个）
    pub fn begin_task(&self) -> CancellationToken {
        let token = self.session.child_token();
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        token
    }

    /// 取消当前任务；没有任务时返回 false
    pub fn cancel_task(&self) -> bool {
        match self.task.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn end_task(&self) {
        self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// 会话结束（Ctrl+C / 进程退出）
    pub fn shutdown(&self) {
        self.session.cancel();
    }

    pub fn session_token(&self) -> CancellationToken {
        self.session.clone()
    }
}
