//! 驱动错误类型

use core::fmt;

/// 异步 memcpy 驱动错误
///
/// 所有失败都同步返回给调用者；中断上下文中的失败不会上报。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum McpError {
    /// 参数无效: 空指针、零长度、DMA 不可访问的内存区域、对齐不满足
    InvalidArgument,
    /// 内存不足: 事务池、描述符或暂存缓冲区分配失败
    OutOfMemory,
    /// 状态无效: 没有空闲事务槽位，或驱动仍有未完成的事务
    InvalidState,
    /// 当前后端不支持该功能 (例如 ETM)
    NotSupported,
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "Invalid argument"),
            Self::OutOfMemory => write!(f, "Out of DMA-capable memory"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::NotSupported => write!(f, "Not supported by this backend"),
        }
    }
}

/// 驱动结果类型
pub type McpResult<T> = Result<T, McpError>;
