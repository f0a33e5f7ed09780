//! 内置中间件

pub mod chat_mode;
pub mod logging;
pub mod todo;

pub use chat_mode::ChatModeMiddleware;
pub use logging::LoggingMiddleware;
pub use todo::{parse_todos, TodoMiddleware};
