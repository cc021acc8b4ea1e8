//! 核心层：运行时状态机、能力模式、任务模型、规划校验、编排与取消

pub mod error;
pub mod mode;
pub mod orchestrator;
pub mod planner;
pub mod session_supervisor;
pub mod state;
pub mod task;

pub use error::{ErrorKind, RollbackOutcome, RuntimeError, TaskFailure};
pub use mode::{
    Allowance, CapabilityMode, EffectTag, FileModeStore, InMemoryModeStore, ModePolicy, ModeStore,
};
pub use orchestrator::{OrchestratorConfig, TaskOrchestrator};
pub use planner::{validate_plan, Planner};
pub use session_supervisor::SessionSupervisor;
pub use state::{
    RuntimeState, StateEvent, StateMachine, Subscriber, SubscriptionId, TransitionRecord,
};
pub use task::{Step, StepStatus, Task, TaskStatus};
