//! Hive - Rust 编码智能体运行时
//!
//! 模块划分：
//! - **agent**: 组合根，由配置构建运行时并暴露任务、工具、问答与撤销入口
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、能力模式、任务模型、规划与编排、会话监管
//! - **llm**: LLM 后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）及多后端路由
//! - **observability**: 日志初始化
//! - **tools**: 能力门控的工具注册表、执行器与回滚栈、内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod tools;
