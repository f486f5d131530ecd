//! 内存管理模块
//!
//! 提供以下功能:
//! - DMA 描述符与链表构建 (`dma`)
//! - cache 一致性辅助 (`cache`)
//! - 固定容量槽位池 (`pool`)
//!
//! # 内存区域
//!
//! ESP32 系列芯片上 DMA 可访问的内存分为两类:
//! - 内部 SRAM: 所有 DMA 后端都可访问
//! - 外部 PSRAM: 只有 GDMA 且开启外部内存访问时可用，位于 cache 之后
//!
//! 描述符本身必须位于 DMA 可访问的内部内存中。

pub mod cache;
pub mod dma;
pub mod pool;

// 重导出常用类型
pub use cache::{MsyncFlags, RxSplit};
pub use dma::{
    mount_buffers, BufferMount, DmaBuffer, DmaDescriptor, LinkList, LinkListConfig,
    DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
};
pub use pool::{PoolStats, SlotPool, SlotState};
