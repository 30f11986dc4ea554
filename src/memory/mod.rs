//! 记忆层：步骤对话（短期）与尝试记录（中期）

pub mod conversation;
pub mod working;

pub use conversation::{Conversation, Message, Role};
pub use working::WorkingMemory;
