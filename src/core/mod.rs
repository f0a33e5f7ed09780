//! 核心装配层：错误类型、请求终态、Agent 构建器

pub mod builder;
pub mod error;
pub mod outcome;

pub use builder::{create_agent_builder, AgentBuilder, AgentComponents};
pub use error::AgentError;
pub use outcome::AgentOutcome;
