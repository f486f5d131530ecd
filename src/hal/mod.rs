//! 硬件协作接口
//!
//! 驱动只通过这里的 trait 与硬件打交道，寄存器级实现不在本 crate 内:
//! - `DmaChannel`: 一对 TX/RX DMA 通道 (CP-DMA 引擎或一对 GDMA 通道)
//! - `Platform`: 内存映射与 cache 维护
//!
//! 通道的分配与释放对应 Rust 的构造与 drop。完成中断的 "回调注册"
//! 对应 `listen_rx_eof`: 中断发生时平台的 ISR 调用驱动的
//! `AsyncMemcpy::on_interrupt`，后者再通过 `take_rx_eof` 应答中断。
//!
//! `loopback` 提供纯软件实现，用于主机测试和无硬件环境。

pub mod loopback;

use crate::error::{McpError, McpResult};
use crate::mem::cache::MsyncFlags;

pub use loopback::{LoopbackDma, LoopbackPlatform};

/// 内存区域
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum MemRegion {
    /// 内部 SRAM
    Internal,
    /// 外部 PSRAM
    External,
}

/// 传输方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 从内存读出 (源)
    Tx,
    /// 写入内存 (目标)
    Rx,
}

/// 通道对齐约束 (字节，0 表示该区域不可访问)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentConstraints {
    /// 内部内存
    pub internal: usize,
    /// 外部内存
    pub external: usize,
}

impl AlignmentConstraints {
    /// 指定区域的对齐
    pub fn for_region(&self, region: MemRegion) -> usize {
        match region {
            MemRegion::Internal => self.internal,
            MemRegion::External => self.external,
        }
    }
}

/// DMA 触发源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTrigger {
    /// 内存到内存 (伪外设)
    Mem2Mem {
        /// 伪外设编号
        id: u8,
    },
}

/// 通道传输配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferConfig {
    /// 最大突发长度 (字节，0 表示关闭突发)
    pub max_data_burst_size: usize,
    /// 是否访问外部内存
    pub access_ext_mem: bool,
    /// 通道仲裁权重
    pub weight: Option<u32>,
}

/// 通道支持的 ETM 事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaEtmEvent {
    /// RX 收到 EOF
    EofReached,
}

/// ETM 事件句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EtmEvent {
    /// 事件在事件矩阵中的编号
    pub id: u32,
    /// 事件类型
    pub kind: DmaEtmEvent,
}

/// 一对用于内存拷贝的 DMA 通道
pub trait DmaChannel {
    /// 连接触发源
    fn connect(&self, trigger: DmaTrigger) -> McpResult<()>;

    /// 断开触发源
    fn disconnect(&self);

    /// 配置突发长度、外部内存访问和权重
    fn config_transfer(&self, config: &TransferConfig) -> McpResult<()>;

    /// 查询对齐约束 (依赖 `config_transfer` 的结果)
    fn alignment_constraints(&self, direction: Direction) -> AlignmentConstraints;

    /// 使能 / 关闭 RX EOF 中断
    fn listen_rx_eof(&self, enable: bool);

    /// 以给定的描述符链启动一次传输
    ///
    /// # Safety
    ///
    /// 两条描述符链及其缓冲区在 RX EOF 中断被应答之前必须保持有效，
    /// 且不能被 CPU 修改。
    unsafe fn start(&self, tx_head: usize, rx_head: usize);

    /// 停止通道
    fn stop(&self);

    /// 应答 RX EOF 中断，返回收到 EOF 的描述符地址
    fn take_rx_eof(&self) -> Option<usize>;

    /// 创建 ETM 事件
    fn new_etm_event(&self, _event: DmaEtmEvent) -> McpResult<EtmEvent> {
        Err(McpError::NotSupported)
    }
}

/// 内存映射与 cache 维护
pub trait Platform {
    /// 判断 `[addr, addr + len)` 所在区域，DMA 不可访问时返回 `None`
    fn region(&self, addr: usize, len: usize) -> Option<MemRegion>;

    /// 区域的数据 cache line 大小 (0 表示不经过 cache)
    fn cache_line_size(&self, region: MemRegion) -> usize;

    /// cache 同步
    fn msync(&self, addr: usize, len: usize, flags: MsyncFlags) -> McpResult<()>;

    /// 是否存在 DMA 可访问的外部内存
    fn has_external_memory(&self) -> bool {
        false
    }
}

impl<T: DmaChannel + ?Sized> DmaChannel for &T {
    fn connect(&self, trigger: DmaTrigger) -> McpResult<()> {
        (**self).connect(trigger)
    }

    fn disconnect(&self) {
        (**self).disconnect()
    }

    fn config_transfer(&self, config: &TransferConfig) -> McpResult<()> {
        (**self).config_transfer(config)
    }

    fn alignment_constraints(&self, direction: Direction) -> AlignmentConstraints {
        (**self).alignment_constraints(direction)
    }

    fn listen_rx_eof(&self, enable: bool) {
        (**self).listen_rx_eof(enable)
    }

    unsafe fn start(&self, tx_head: usize, rx_head: usize) {
        (**self).start(tx_head, rx_head)
    }

    fn stop(&self) {
        (**self).stop()
    }

    fn take_rx_eof(&self) -> Option<usize> {
        (**self).take_rx_eof()
    }

    fn new_etm_event(&self, event: DmaEtmEvent) -> McpResult<EtmEvent> {
        (**self).new_etm_event(event)
    }
}

impl<T: Platform + ?Sized> Platform for &T {
    fn region(&self, addr: usize, len: usize) -> Option<MemRegion> {
        (**self).region(addr, len)
    }

    fn cache_line_size(&self, region: MemRegion) -> usize {
        (**self).cache_line_size(region)
    }

    fn msync(&self, addr: usize, len: usize, flags: MsyncFlags) -> McpResult<()> {
        (**self).msync(addr, len, flags)
    }

    fn has_external_memory(&self) -> bool {
        (**self).has_external_memory()
    }
}
