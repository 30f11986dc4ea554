//! 执行层：步骤对话构建（planner）、步骤状态机（machine）、运行事件（events）

pub mod events;
pub mod machine;
pub mod planner;

pub use events::{send_event, RunEvent, RunEventSender};
pub use machine::{StepReport, StepStateMachine};
pub use planner::DEFAULT_SYSTEM_PROMPT;
