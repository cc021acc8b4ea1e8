//! 回滚记录栈
//!
//! 每个成功的可回滚步骤追加一条 RollbackEntry；失败或用户撤销时按逆序弹出。
//! 只有 push / pop 两种修改，写入方始终是当前正在执行的步骤。

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Debug, Serialize)]
pub struct RollbackEntry {
    pub tool_name: String,
    pub rollback_data: Value,
    pub timestamp: DateTime<Utc>,
}

impl RollbackEntry {
    pub fn new(tool_name: impl Into<String>, rollback_data: Value) -> Self {
        Self {
            tool_name: tool_name.into(),
            rollback_data,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Default)]
pub struct RollbackStack {
    entries: Mutex<Vec<RollbackEntry>>,
}

impl RollbackStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entry: RollbackEntry) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
    }

    pub fn pop(&self) -> Option<RollbackEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 从旧到新的副本
    pub fn entries(&self) -> Vec<RollbackEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
