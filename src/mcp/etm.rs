//! ETM 事件

use crate::hal::DmaEtmEvent;

/// 驱动可导出的 ETM 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpEtmEvent {
    /// 一次拷贝完成
    CopyDone,
}

impl From<McpEtmEvent> for DmaEtmEvent {
    fn from(event: McpEtmEvent) -> Self {
        match event {
            McpEtmEvent::CopyDone => DmaEtmEvent::EofReached,
        }
    }
}
