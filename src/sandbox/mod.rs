//! 沙箱层：路径守卫（虚拟路径 ↔ 真实路径）与基于它的文件/命令服务

pub mod error;
pub mod path_guard;
pub mod service;

pub use error::{SandboxError, SandboxErrorCode};
pub use path_guard::{
    is_within_virtual, normalize_posix, AccessMode, PathGuard, SandboxResolvedPath,
    DEFAULT_VIRTUAL_ROOT,
};
pub use service::{
    DirEntry, ExecOutcome, SandboxService, SandboxSettings, WriteOptions, WriteOutcome,
};
