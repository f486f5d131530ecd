//! 软件回环 DMA
//!
//! 用纯软件模拟一对内存拷贝 DMA 通道与内存映射，便于在主机上运行
//! 完整的驱动 (状态机、事务池、描述符链、中断路径)。
//!
//! - `LoopbackDma`: `start` 只记录描述符链头，`process` 模拟硬件执行一次
//!   传输: 沿 TX 链读取直到 EOF 节点，把数据散写到 RX 链，把描述符交还 CPU，
//!   在最后写入的 RX 节点上标记 EOF 并锁存 RX EOF 中断。
//! - `LoopbackPlatform`: 可配置外部内存 / 禁止访问区域、cache line 大小，
//!   记录所有 cache 同步调用，并可注入同步失败。
//!
//! 源数据在 `process` 时才被读取，与真实硬件一样: 提交后、完成前修改源缓冲区
//! 会影响拷贝结果。
//!
//! # 示例
//!
//! ```rust,ignore
//! let dma = LoopbackDma::new();
//! let platform = LoopbackPlatform::new();
//! let mcp = install_gdma(&McpConfig::default(), &dma, &platform)?;
//! unsafe { mcp.memcpy(dst, src, len, Some(done), core::ptr::null_mut())? };
//! while dma.process() {
//!     mcp.on_interrupt();
//! }
//! ```

use core::cell::RefCell;
use core::ops::Range;

use heapless::Deque;
use portable_atomic::{AtomicBool, Ordering};

use crate::error::{McpError, McpResult};
use crate::hal::{
    AlignmentConstraints, Direction, DmaChannel, DmaEtmEvent, DmaTrigger, EtmEvent, MemRegion,
    Platform, TransferConfig,
};
use crate::mem::cache::MsyncFlags;
use crate::mem::dma::{DmaDescriptor, Owner};
use crate::sync::IsrSafeMutex;
use crate::util::log::*;

/// 开启外部内存访问时默认的外部内存对齐
pub const DEFAULT_EXT_MEM_ALIGNMENT: usize = 32;

/// 开启突发时内部内存的对齐
const BURST_INT_MEM_ALIGNMENT: usize = 4;

/// cache 同步记录容量
pub const MSYNC_JOURNAL_LEN: usize = 32;

#[derive(Default)]
struct EngineState {
    trigger: Option<DmaTrigger>,
    config: TransferConfig,
    listening: bool,
    running: Option<(usize, usize)>,
    rx_eof: Option<usize>,
    starts: u32,
    overlapping_starts: u32,
    completed: u32,
    errors: u32,
    next_etm_id: u32,
}

/// 软件回环 DMA 通道对
pub struct LoopbackDma {
    state: IsrSafeMutex<RefCell<EngineState>>,
    etm_supported: bool,
    ext_mem_alignment: usize,
}

impl LoopbackDma {
    /// 创建通道对
    pub fn new() -> Self {
        Self {
            state: IsrSafeMutex::new(RefCell::new(EngineState::default())),
            etm_supported: false,
            ext_mem_alignment: DEFAULT_EXT_MEM_ALIGNMENT,
        }
    }

    /// 支持 ETM 事件
    pub fn with_etm(mut self) -> Self {
        self.etm_supported = true;
        self
    }

    /// 设置外部内存对齐
    pub fn with_ext_mem_alignment(mut self, alignment: usize) -> Self {
        self.ext_mem_alignment = alignment;
        self
    }

    /// 是否有传输正在进行
    pub fn is_busy(&self) -> bool {
        self.state.lock(|s| s.borrow().running.is_some())
    }

    /// 已连接的触发源
    pub fn trigger(&self) -> Option<DmaTrigger> {
        self.state.lock(|s| s.borrow().trigger)
    }

    /// 最近一次的传输配置
    pub fn transfer_config(&self) -> TransferConfig {
        self.state.lock(|s| s.borrow().config)
    }

    /// RX EOF 中断是否使能
    pub fn is_listening(&self) -> bool {
        self.state.lock(|s| s.borrow().listening)
    }

    /// 启动次数
    pub fn starts(&self) -> u32 {
        self.state.lock(|s| s.borrow().starts)
    }

    /// 在上一次传输未结束时再次启动的次数
    pub fn overlapping_starts(&self) -> u32 {
        self.state.lock(|s| s.borrow().overlapping_starts)
    }

    /// 完成的传输数
    pub fn completed(&self) -> u32 {
        self.state.lock(|s| s.borrow().completed)
    }

    /// 描述符错误数
    pub fn errors(&self) -> u32 {
        self.state.lock(|s| s.borrow().errors)
    }

    /// 执行当前传输
    ///
    /// 没有正在进行的传输时返回 `false`。传输结束后锁存 RX EOF 中断，
    /// 调用者随后应调用驱动的中断处理函数。
    pub fn process(&self) -> bool {
        let Some((tx_head, rx_head)) = self.state.lock(|s| s.borrow().running) else {
            return false;
        };

        // SAFETY: `start` 的调用者保证两条链在 EOF 应答前有效且不被 CPU 修改
        let eof = unsafe { execute(tx_head, rx_head) };

        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.running = None;
            match eof {
                Some(addr) => {
                    s.rx_eof = Some(addr);
                    s.completed += 1;
                }
                None => {
                    s.errors += 1;
                    log_error!("loopback: descriptor error");
                }
            }
        });
        eof.is_some()
    }
}

impl Default for LoopbackDma {
    fn default() -> Self {
        Self::new()
    }
}

/// 模拟硬件沿描述符链搬运数据，返回收到 EOF 的 RX 节点地址
///
/// # Safety
///
/// 两条链中的节点及其缓冲区必须有效。
unsafe fn execute(tx_head: usize, rx_head: usize) -> Option<usize> {
    let mut tx = tx_head as *mut DmaDescriptor;
    let mut rx = rx_head as *mut DmaDescriptor;
    if tx.is_null() || rx.is_null() {
        return None;
    }

    let mut rx_offset = 0;
    loop {
        let tx_node = &mut *tx;
        if tx_node.owner() != Owner::Dma {
            return None;
        }
        let mut src = tx_node.buffer as *const u8;
        let mut remaining = tx_node.length();
        while remaining > 0 {
            while rx_offset == (*rx).size() {
                (*rx).set_owner(Owner::Cpu);
                rx = (*rx).next;
                rx_offset = 0;
                if rx.is_null() {
                    return None;
                }
            }
            let rx_node = &mut *rx;
            let chunk = usize::min(rx_node.size() - rx_offset, remaining);
            core::ptr::copy(src, rx_node.buffer.add(rx_offset), chunk);
            rx_offset += chunk;
            src = src.add(chunk);
            remaining -= chunk;
            rx_node.set_length(rx_offset);
        }
        tx_node.set_owner(Owner::Cpu);
        if tx_node.is_eof() {
            break;
        }
        tx = tx_node.next;
        if tx.is_null() {
            return None;
        }
    }

    let rx_node = &mut *rx;
    rx_node.set_eof(true);
    rx_node.set_owner(Owner::Cpu);
    Some(rx as usize)
}

impl DmaChannel for LoopbackDma {
    fn connect(&self, trigger: DmaTrigger) -> McpResult<()> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.trigger.is_some() {
                return Err(McpError::InvalidState);
            }
            s.trigger = Some(trigger);
            Ok(())
        })
    }

    fn disconnect(&self) {
        self.state.lock(|s| s.borrow_mut().trigger = None);
    }

    fn config_transfer(&self, config: &TransferConfig) -> McpResult<()> {
        if !config.max_data_burst_size.is_power_of_two() && config.max_data_burst_size != 0 {
            return Err(McpError::InvalidArgument);
        }
        self.state.lock(|s| s.borrow_mut().config = *config);
        Ok(())
    }

    fn alignment_constraints(&self, _direction: Direction) -> AlignmentConstraints {
        let config = self.transfer_config();
        let internal = if config.max_data_burst_size > 0 {
            BURST_INT_MEM_ALIGNMENT
        } else {
            1
        };
        let external = if config.access_ext_mem {
            usize::max(self.ext_mem_alignment, config.max_data_burst_size)
        } else {
            0
        };
        AlignmentConstraints { internal, external }
    }

    fn listen_rx_eof(&self, enable: bool) {
        self.state.lock(|s| s.borrow_mut().listening = enable);
    }

    unsafe fn start(&self, tx_head: usize, rx_head: usize) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.starts += 1;
            if s.running.is_some() || s.rx_eof.is_some() {
                s.overlapping_starts += 1;
            }
            s.running = Some((tx_head, rx_head));
        });
    }

    fn stop(&self) {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.running = None;
            s.rx_eof = None;
        });
    }

    fn take_rx_eof(&self) -> Option<usize> {
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            if s.listening {
                s.rx_eof.take()
            } else {
                None
            }
        })
    }

    fn new_etm_event(&self, event: DmaEtmEvent) -> McpResult<EtmEvent> {
        if !self.etm_supported {
            return Err(McpError::NotSupported);
        }
        self.state.lock(|s| {
            let mut s = s.borrow_mut();
            s.next_etm_id += 1;
            Ok(EtmEvent {
                id: s.next_etm_id,
                kind: event,
            })
        })
    }
}

/// 一次 cache 同步调用
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsyncRecord {
    /// 起始地址
    pub addr: usize,
    /// 长度
    pub len: usize,
    /// 标志
    pub flags: MsyncFlags,
}

/// 软件内存映射
pub struct LoopbackPlatform {
    external: Option<(usize, usize)>,
    forbidden: Option<(usize, usize)>,
    internal_cache_line: usize,
    external_cache_line: usize,
    fail_msync: AtomicBool,
    journal: IsrSafeMutex<RefCell<Deque<MsyncRecord, MSYNC_JOURNAL_LEN>>>,
}

impl LoopbackPlatform {
    /// 全部内存视为内部 SRAM，不经过 cache
    pub fn new() -> Self {
        Self {
            external: None,
            forbidden: None,
            internal_cache_line: 0,
            external_cache_line: 0,
            fail_msync: AtomicBool::new(false),
            journal: IsrSafeMutex::new(RefCell::new(Deque::new())),
        }
    }

    /// 把一段地址视为外部 PSRAM
    pub fn with_external_range(mut self, range: Range<usize>) -> Self {
        self.external = Some((range.start, range.end));
        self
    }

    /// 把一段地址视为 DMA 不可访问 (例如 flash)
    pub fn with_forbidden_range(mut self, range: Range<usize>) -> Self {
        self.forbidden = Some((range.start, range.end));
        self
    }

    /// 设置某个区域的 cache line 大小
    pub fn with_cache_line(mut self, region: MemRegion, size: usize) -> Self {
        match region {
            MemRegion::Internal => self.internal_cache_line = size,
            MemRegion::External => self.external_cache_line = size,
        }
        self
    }

    /// 让后续的 cache 同步失败
    pub fn set_msync_failure(&self, fail: bool) {
        self.fail_msync.store(fail, Ordering::Release);
    }

    /// 最近的 cache 同步调用 (按时间顺序)
    pub fn msync_records(&self) -> heapless::Vec<MsyncRecord, MSYNC_JOURNAL_LEN> {
        self.journal
            .lock(|j| j.borrow().iter().copied().collect())
    }

    /// 清空同步记录
    pub fn clear_msync_records(&self) {
        self.journal.lock(|j| j.borrow_mut().clear());
    }
}

impl Default for LoopbackPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn overlaps(range: Option<(usize, usize)>, start: usize, end: usize) -> bool {
    range.is_some_and(|(lo, hi)| start < hi && lo < end)
}

impl Platform for LoopbackPlatform {
    fn region(&self, addr: usize, len: usize) -> Option<MemRegion> {
        let end = addr.checked_add(len)?;
        if overlaps(self.forbidden, addr, end) {
            return None;
        }
        match self.external {
            Some((lo, hi)) if addr >= lo && end <= hi => Some(MemRegion::External),
            // 跨越内外部边界的缓冲区不可用
            ext if overlaps(ext, addr, end) => None,
            _ => Some(MemRegion::Internal),
        }
    }

    fn cache_line_size(&self, region: MemRegion) -> usize {
        match region {
            MemRegion::Internal => self.internal_cache_line,
            MemRegion::External => self.external_cache_line,
        }
    }

    fn msync(&self, addr: usize, len: usize, flags: MsyncFlags) -> McpResult<()> {
        if self.fail_msync.load(Ordering::Acquire) {
            return Err(McpError::InvalidArgument);
        }
        let line = self
            .region(addr, len)
            .map(|region| self.cache_line_size(region))
            .unwrap_or(0);
        if line > 1 && !flags.contains(MsyncFlags::UNALIGNED) && (addr % line != 0 || len % line != 0) {
            return Err(McpError::InvalidArgument);
        }
        self.journal.lock(|j| {
            let mut j = j.borrow_mut();
            if j.is_full() {
                j.pop_front();
            }
            let _ = j.push_back(MsyncRecord { addr, len, flags });
        });
        Ok(())
    }

    fn has_external_memory(&self) -> bool {
        self.external.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::dma::{mount_buffers, BufferMount, LinkList, LinkListConfig};

    fn list(len: usize, max: usize) -> LinkList {
        LinkList::new(LinkListConfig {
            num_items: len,
            max_buffer_size: max,
        })
        .unwrap()
    }

    #[test]
    fn test_region_mapping() {
        let platform = LoopbackPlatform::new()
            .with_external_range(0x1000..0x2000)
            .with_forbidden_range(0x4000..0x5000);
        assert_eq!(platform.region(0x1000, 0x100), Some(MemRegion::External));
        assert_eq!(platform.region(0x800, 0x100), Some(MemRegion::Internal));
        assert_eq!(platform.region(0xF00, 0x200), None);
        assert_eq!(platform.region(0x4FFF, 1), None);
        assert!(platform.has_external_memory());
        assert!(!LoopbackPlatform::new().has_external_memory());
    }

    #[test]
    fn test_msync_journal_and_failure() {
        let platform = LoopbackPlatform::new().with_cache_line(MemRegion::Internal, 32);
        platform
            .msync(0x100, 64, MsyncFlags::DIR_M2C)
            .unwrap();
        assert_eq!(
            platform.msync(0x101, 64, MsyncFlags::DIR_M2C),
            Err(McpError::InvalidArgument)
        );
        platform
            .msync(0x101, 3, MsyncFlags::DIR_C2M | MsyncFlags::UNALIGNED)
            .unwrap();
        assert_eq!(platform.msync_records().len(), 2);

        platform.set_msync_failure(true);
        assert!(platform.msync(0x100, 32, MsyncFlags::DIR_M2C).is_err());
        platform.clear_msync_records();
        assert!(platform.msync_records().is_empty());
    }

    #[test]
    fn test_alignment_follows_config() {
        let dma = LoopbackDma::new();
        let align = dma.alignment_constraints(Direction::Rx);
        assert_eq!(align, AlignmentConstraints { internal: 1, external: 0 });

        dma.config_transfer(&TransferConfig {
            max_data_burst_size: 16,
            access_ext_mem: true,
            weight: None,
        })
        .unwrap();
        let align = dma.alignment_constraints(Direction::Tx);
        assert_eq!(align, AlignmentConstraints { internal: 4, external: 32 });

        let bad = TransferConfig {
            max_data_burst_size: 12,
            ..TransferConfig::default()
        };
        assert_eq!(dma.config_transfer(&bad), Err(McpError::InvalidArgument));
    }

    #[test]
    fn test_process_scatters_into_rx_chain() {
        let mut src: [u8; 100] = core::array::from_fn(|i| i as u8);
        let mut dst = [0u8; 100];
        let mut tx = list(4, 30);
        mount_buffers(&mut tx, None, &[BufferMount::new(src.as_mut_ptr(), 100).eof().last()]).unwrap();
        let mut rx = list(3, 40);
        mount_buffers(&mut rx, None, &[BufferMount::new(dst.as_mut_ptr(), 100).last()]).unwrap();

        let dma = LoopbackDma::new();
        dma.listen_rx_eof(true);
        assert!(!dma.process());
        unsafe { dma.start(tx.head_addr(), rx.head_addr()) };
        assert!(dma.is_busy());
        assert!(dma.process());
        assert!(!dma.is_busy());

        assert_eq!(src, dst);
        let eof = dma.take_rx_eof().unwrap();
        let last = rx.node(2).unwrap();
        assert_eq!(eof, last as *const DmaDescriptor as usize);
        assert!(last.is_eof());
        assert_eq!(last.length(), 20);
        assert!((0..4).all(|i| tx.node(i).unwrap().is_complete()));
        assert_eq!(dma.take_rx_eof(), None);
        assert_eq!((dma.starts(), dma.completed(), dma.errors()), (1, 1, 0));
    }

    #[test]
    fn test_short_rx_chain_is_an_error() {
        let mut src = [1u8; 64];
        let mut dst = [0u8; 32];
        let mut tx = list(1, 4095);
        mount_buffers(&mut tx, None, &[BufferMount::new(src.as_mut_ptr(), 64).eof().last()]).unwrap();
        let mut rx = list(1, 4095);
        mount_buffers(&mut rx, None, &[BufferMount::new(dst.as_mut_ptr(), 32).last()]).unwrap();

        let dma = LoopbackDma::new();
        dma.listen_rx_eof(true);
        unsafe { dma.start(tx.head_addr(), rx.head_addr()) };
        assert!(!dma.process());
        assert_eq!(dma.errors(), 1);
        assert_eq!(dma.take_rx_eof(), None);
    }

    #[test]
    fn test_overlapping_start_is_counted() {
        let dma = LoopbackDma::new();
        unsafe {
            dma.start(0x10, 0x20);
            dma.start(0x30, 0x40);
        }
        assert_eq!(dma.overlapping_starts(), 1);
        dma.stop();
        assert!(!dma.is_busy());
    }

    #[test]
    fn test_etm_support() {
        assert_eq!(
            LoopbackDma::new().new_etm_event(DmaEtmEvent::EofReached),
            Err(McpError::NotSupported)
        );
        let dma = LoopbackDma::new().with_etm();
        let first = dma.new_etm_event(DmaEtmEvent::EofReached).unwrap();
        let second = dma.new_etm_event(DmaEtmEvent::EofReached).unwrap();
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn test_connect_twice_rejected() {
        let dma = LoopbackDma::new();
        dma.connect(DmaTrigger::Mem2Mem { id: 0 }).unwrap();
        assert_eq!(dma.connect(DmaTrigger::Mem2Mem { id: 0 }), Err(McpError::InvalidState));
        dma.disconnect();
        assert_eq!(dma.trigger(), None);
    }
}
