//! 认知层：Planner 解析、落盘策略、澄清子流程、进度事件与主循环

pub mod clarification;
pub mod events;
pub mod loop_;
pub mod persist;
pub mod planner;

pub use clarification::{fallback_options, ClarificationGenerator, ClarificationKind};
pub use events::{send_event, ClarificationOption, ProgressEvent, Stage, SubagentPayload};
pub use loop_::{AgentRequest, PlannerLoop, PlannerSettings};
pub use persist::{
    check_output_target, default_output_path, resolve_persist_path, HeuristicPersistPolicy,
    PersistPathCode, PersistPathError, PersistPathResolution, PersistPolicy, PersistReason,
    PersistRequirement,
};
pub use planner::{parse_planner_output, PlannerAction, PlannerParseError, PlannerPrompt};
