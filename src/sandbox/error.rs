//! 沙箱错误：带稳定错误码，便于 Planner 根据 code 决定下一步（澄清 / 停止 / 继续）

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// 沙箱错误码（Display 输出 SCREAMING_SNAKE_CASE，会原样出现在 Observation 文本开头）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SandboxErrorCode {
    InvalidPath,
    PathOutsideVirtualRoot,
    PathOutsideWorkspace,
    FileExists,
    FileTooLarge,
    CommandNotAllowed,
    CommandTimeout,
    Io,
}

impl SandboxErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxErrorCode::InvalidPath => "INVALID_PATH",
            SandboxErrorCode::PathOutsideVirtualRoot => "PATH_OUTSIDE_VIRTUAL_ROOT",
            SandboxErrorCode::PathOutsideWorkspace => "PATH_OUTSIDE_WORKSPACE",
            SandboxErrorCode::FileExists => "FILE_EXISTS",
            SandboxErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            SandboxErrorCode::CommandNotAllowed => "COMMAND_NOT_ALLOWED",
            SandboxErrorCode::CommandTimeout => "COMMAND_TIMEOUT",
            SandboxErrorCode::Io => "IO_ERROR",
        }
    }

    /// 是否属于路径/文件越权类违规（而非普通 IO 失败）
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            SandboxErrorCode::InvalidPath
                | SandboxErrorCode::PathOutsideVirtualRoot
                | SandboxErrorCode::PathOutsideWorkspace
                | SandboxErrorCode::FileExists
        )
    }

    /// 缺失或非法路径：重试同一路径没有意义
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            SandboxErrorCode::InvalidPath
                | SandboxErrorCode::PathOutsideVirtualRoot
                | SandboxErrorCode::PathOutsideWorkspace
        )
    }

    pub fn parse(code: &str) -> Option<Self> {
        [
            SandboxErrorCode::InvalidPath,
            SandboxErrorCode::PathOutsideVirtualRoot,
            SandboxErrorCode::PathOutsideWorkspace,
            SandboxErrorCode::FileExists,
            SandboxErrorCode::FileTooLarge,
            SandboxErrorCode::CommandNotAllowed,
            SandboxErrorCode::CommandTimeout,
            SandboxErrorCode::Io,
        ]
        .into_iter()
        .find(|c| c.as_str() == code)
    }
}

impl fmt::Display for SandboxErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 沙箱错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct SandboxError {
    pub code: SandboxErrorCode,
    pub message: String,
}

impl SandboxError {
    pub fn new(code: SandboxErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_path(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorCode::InvalidPath, message)
    }

    pub fn outside_virtual_root(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorCode::PathOutsideVirtualRoot, message)
    }

    pub fn outside_workspace(message: impl Into<String>) -> Self {
        Self::new(SandboxErrorCode::PathOutsideWorkspace, message)
    }

    pub fn io(context: &str, err: std::io::Error) -> Self {
        Self::new(SandboxErrorCode::Io, format!("{}: {}", context, err))
    }
}
