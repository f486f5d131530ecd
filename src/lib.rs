//! RustMCP - ESP32 系列芯片的异步内存拷贝 DMA 引擎
//!
//! 本库提供以下核心功能:
//! - 固定容量的事务池 (idle / ready 两条 FIFO 队列)
//! - DMA 描述符链构建，含对齐与 cache 一致性处理
//! - CP-DMA / GDMA 两种后端
//! - 以 CAS 保护的引擎状态机，保证同一时刻只有一个硬件事务
//! - 完成中断处理: 用户回调、回收事务、自动启动下一个事务
//! - 条件编译日志系统
//!
//! 寄存器级的通道编程与 cache 维护由 `hal` 中的 trait 抽象，
//! `hal::loopback` 提供纯软件实现。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

// defmt 日志经 RTT 输出
#[cfg(feature = "log-defmt")]
use defmt_rtt as _;

pub mod error;
pub mod hal;
pub mod mcp;
pub mod mem;
pub mod sync;
pub mod util;

// ===== 重导出常用类型 =====
pub use error::{McpError, McpResult};
pub use mcp::{
    install_cpdma, install_gdma, AsyncMemcpy, CpDma, Gdma, McpCallback, McpConfig, McpEtmEvent,
    McpEvent, McpFsm,
};

// ===== 版本信息 =====
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// 驱动配置常量
pub mod config {
    /// 默认事务积压深度 (`backlog` 为 0 时使用)
    pub const DEFAULT_BACKLOG: usize = 4;

    /// 通道仲裁权重上限
    pub const MAX_CHANNEL_WEIGHT: u32 = 15;

    /// 内存拷贝使用的伪外设编号
    pub const MEM2MEM_TRIGGER_ID: u8 = 0;
}
