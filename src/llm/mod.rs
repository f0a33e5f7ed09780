//! LLM 层：消息类型、Model Service 抽象、按角色路由、Mock 实现

pub mod message;
pub mod mock;
pub mod router;
pub mod traits;

pub use message::{Message, Role};
pub use mock::MockModelService;
pub use router::{ModelRole, ModelRouting};
pub use traits::{LlmError, ModelRequest, ModelResponse, ModelService, RuntimeConfig, TokenUsage};
