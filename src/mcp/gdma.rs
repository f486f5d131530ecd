//! GDMA 后端
//!
//! GDMA 可以访问内部 SRAM，开启外部内存访问后也能访问 PSRAM。
//! 与 CP-DMA 相比多了两件事:
//!
//! - 对齐: TX/RX 的内部/外部内存对齐从通道查询，RX 对齐还要提升到
//!   所在区域的 cache line 大小；单节点最大长度为 4095 向下对齐到最大对齐。
//! - cache: 源缓冲区在 DMA 读取前写回；目标缓冲区按 head/body/tail 拆分，
//!   head 和 tail 先写入事务的暂存缓冲区，完成后失效 cache 再合并回目标缓冲区。
//!
//! ```text
//!   TX: [src ............................................] (EOF)
//!   RX: [stash head] -> [dst body ... ] -> [stash tail = eof_node]
//! ```

use heapless::Vec;

use crate::config::MEM2MEM_TRIGGER_ID;
use crate::error::{McpError, McpResult};
use crate::hal::{
    AlignmentConstraints, Direction, DmaChannel, DmaTrigger, EtmEvent, MemRegion, Platform,
    TransferConfig,
};
use crate::mcp::backend::McpBackend;
use crate::mcp::config::McpConfig;
use crate::mcp::etm::McpEtmEvent;
use crate::mcp::transaction::Transaction;
use crate::mem::cache::{MsyncFlags, RxSplit};
use crate::mem::dma::{
    align_down, is_aligned, mount_buffers, node_count, BufferMount, DmaBuffer, LinkList,
    LinkListConfig, DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
};
use crate::util::log::*;

/// GDMA 后端
pub struct Gdma<C: DmaChannel, P: Platform> {
    channel: C,
    platform: P,
    tx_align: AlignmentConstraints,
    rx_align: AlignmentConstraints,
    stash_align: usize,
    max_single_dma_buffer: usize,
}

impl<C: DmaChannel, P: Platform> Gdma<C, P> {
    /// 连接并配置通道，查询对齐，使能完成中断
    pub fn new(config: &McpConfig, channel: C, platform: P) -> McpResult<Self> {
        channel.connect(DmaTrigger::Mem2Mem {
            id: MEM2MEM_TRIGGER_ID,
        })?;
        let mut backend = Self {
            channel,
            platform,
            tx_align: AlignmentConstraints {
                internal: 1,
                external: 0,
            },
            rx_align: AlignmentConstraints {
                internal: 1,
                external: 0,
            },
            stash_align: 1,
            max_single_dma_buffer: DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
        };

        backend.channel.config_transfer(&TransferConfig {
            max_data_burst_size: config.dma_burst_size,
            access_ext_mem: backend.platform.has_external_memory(),
            weight: config.weight,
        })?;

        let tx = backend.channel.alignment_constraints(Direction::Tx);
        let rx = backend.channel.alignment_constraints(Direction::Rx);
        backend.tx_align = AlignmentConstraints {
            internal: tx.internal.max(1),
            external: tx.external,
        };
        backend.rx_align = AlignmentConstraints {
            internal: rx
                .internal
                .max(backend.platform.cache_line_size(MemRegion::Internal))
                .max(1),
            external: if rx.external == 0 {
                0
            } else {
                rx.external
                    .max(backend.platform.cache_line_size(MemRegion::External))
            },
        };
        backend.stash_align = backend.rx_align.internal.max(backend.rx_align.external);

        let max_align = backend
            .stash_align
            .max(backend.tx_align.internal)
            .max(backend.tx_align.external);
        if !max_align.is_power_of_two() || max_align > DMA_DESCRIPTOR_BUFFER_MAX_SIZE {
            log_error!("gdma: unsupported alignment {}", max_align);
            return Err(McpError::InvalidArgument);
        }
        backend.max_single_dma_buffer = align_down(DMA_DESCRIPTOR_BUFFER_MAX_SIZE, max_align);

        backend.channel.listen_rx_eof(true);
        log_debug!(
            "gdma: rx align {}/{}, max buffer {}",
            backend.rx_align.internal,
            backend.rx_align.external,
            backend.max_single_dma_buffer
        );
        Ok(backend)
    }

    /// 单节点最大长度
    pub fn max_single_dma_buffer(&self) -> usize {
        self.max_single_dma_buffer
    }

    /// TX 方向对齐
    pub fn tx_alignment(&self) -> AlignmentConstraints {
        self.tx_align
    }

    /// RX 方向对齐 (含 cache line)
    pub fn rx_alignment(&self) -> AlignmentConstraints {
        self.rx_align
    }

    fn is_cached(&self, addr: usize, len: usize) -> bool {
        self.platform
            .region(addr, len)
            .is_some_and(|region| self.platform.cache_line_size(region) > 0)
    }

    fn invalidate(&self, addr: usize, len: usize) {
        if len == 0 || !self.is_cached(addr, len) {
            return;
        }
        if let Err(_e) = self.platform.msync(addr, len, MsyncFlags::DIR_M2C) {
            log_error!("gdma: invalidate {} bytes failed", len);
        }
    }
}

impl<C: DmaChannel, P: Platform> McpBackend for Gdma<C, P> {
    const NAME: &'static str = "gdma";

    fn new_transaction(&self) -> McpResult<Transaction> {
        let stash = if self.stash_align > 1 {
            Some(DmaBuffer::new(2 * self.stash_align, self.stash_align)?)
        } else {
            None
        };
        Ok(Transaction::new(stash))
    }

    fn check_args(&self, dst: *mut u8, src: *const u8, n: usize) -> McpResult<()> {
        let src_region = self.platform.region(src as usize, n);
        let dst_region = self.platform.region(dst as usize, n);
        let (Some(src_region), Some(dst_region)) = (src_region, dst_region) else {
            log_debug!("gdma: buffer not DMA capable");
            return Err(McpError::InvalidArgument);
        };

        if self.rx_align.for_region(dst_region) == 0 {
            log_debug!("gdma: destination region not accessible");
            return Err(McpError::InvalidArgument);
        }
        let align = self.tx_align.for_region(src_region);
        if align == 0 || !is_aligned(src as usize, align) || !is_aligned(n, align) {
            log_debug!("gdma: source address or length not aligned to {}", align);
            return Err(McpError::InvalidArgument);
        }
        Ok(())
    }

    fn prepare(
        &self,
        trans: &mut Transaction,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> McpResult<()> {
        let dst_region = self
            .platform
            .region(dst as usize, n)
            .ok_or(McpError::InvalidArgument)?;

        if self.is_cached(src as usize, n) {
            self.platform.msync(
                src as usize,
                n,
                MsyncFlags::DIR_C2M | MsyncFlags::UNALIGNED,
            )?;
        }

        let max = self.max_single_dma_buffer;
        let mut tx = LinkList::new(LinkListConfig {
            num_items: node_count(n, max),
            max_buffer_size: max,
        })?;
        mount_buffers(
            &mut tx,
            None,
            &[BufferMount::new(src as *mut u8, n).eof().last()],
        )?;

        let split = RxSplit::new(dst, n, self.rx_align.for_region(dst_region));
        let stash = if split.needs_stash() {
            trans
                .stash
                .as_mut()
                .ok_or(McpError::InvalidState)?
                .as_mut_ptr()
        } else {
            core::ptr::null_mut()
        };

        // 未对齐的 body 前后两段各占暂存缓冲区的一半
        let mut mounts: Vec<BufferMount, 3> = Vec::new();
        let pieces = [
            (stash, split.head),
            (split.body_ptr(), split.body),
            (stash.wrapping_add(split.align), split.tail),
        ];
        for (buffer, length) in pieces.into_iter().filter(|&(_, length)| length > 0) {
            mounts
                .push(BufferMount::new(buffer, length))
                .map_err(|_| McpError::InvalidArgument)?;
        }
        if let Some(final_mount) = mounts.last_mut() {
            *final_mount = final_mount.last();
        }

        let nodes: usize = mounts.iter().map(|m| node_count(m.length, max)).sum();
        let mut rx = LinkList::new(LinkListConfig {
            num_items: nodes.saturating_sub(1),
            max_buffer_size: max,
        })?;
        mount_buffers(&mut rx, Some(&mut trans.eof_node), &mounts)?;

        // body 整行对齐，传输前失效，避免脏行在 DMA 写入后被写回
        if split.body > 0 && self.is_cached(split.body_ptr() as usize, split.body) {
            self.platform
                .msync(split.body_ptr() as usize, split.body, MsyncFlags::DIR_M2C)?;
        }

        trans.tx = Some(tx);
        trans.rx = Some(rx);
        trans.split = split;
        trans.len = n;
        Ok(())
    }

    unsafe fn start(&self, trans: &Transaction) {
        self.channel.start(trans.tx_head(), trans.rx_head());
    }

    fn take_rx_eof(&self) -> Option<usize> {
        self.channel.take_rx_eof()
    }

    fn finish(&self, trans: &mut Transaction) {
        let split = trans.split;
        self.invalidate(split.body_ptr() as usize, split.body);
        if !split.needs_stash() {
            return;
        }
        let Some(stash) = trans.stash.as_ref() else {
            return;
        };
        self.invalidate(stash.as_ptr() as usize, stash.size());
        // SAFETY: 传输已完成，dst 由提交方保证在回调前有效
        unsafe { split.merge(stash.as_slice()) };
    }

    fn new_etm_event(&self, event: McpEtmEvent) -> McpResult<EtmEvent> {
        self.channel.new_etm_event(event.into())
    }
}

impl<C: DmaChannel, P: Platform> Drop for Gdma<C, P> {
    fn drop(&mut self) {
        self.channel.stop();
        self.channel.listen_rx_eof(false);
        self.channel.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{LoopbackDma, LoopbackPlatform};

    #[test]
    fn test_default_alignment() {
        let dma = LoopbackDma::new();
        let platform = LoopbackPlatform::new();
        let backend = Gdma::new(&McpConfig::default(), &dma, &platform).unwrap();
        assert_eq!(backend.max_single_dma_buffer(), 4095);
        assert_eq!(backend.rx_alignment().internal, 1);
        assert!(backend.new_transaction().unwrap().stash.is_none());
        assert!(!dma.transfer_config().access_ext_mem);
    }

    #[test]
    fn test_alignment_raised_to_cache_line() {
        let dma = LoopbackDma::new();
        let platform = LoopbackPlatform::new()
            .with_external_range(0x3C00_0000..0x3E00_0000)
            .with_cache_line(MemRegion::External, 64);
        let config = McpConfig::default().with_dma_burst_size(16).with_weight(3);
        let backend = Gdma::new(&config, &dma, &platform).unwrap();

        assert_eq!(backend.tx_alignment(), AlignmentConstraints { internal: 4, external: 32 });
        assert_eq!(backend.rx_alignment(), AlignmentConstraints { internal: 4, external: 64 });
        assert_eq!(backend.max_single_dma_buffer(), 4032);
        assert_eq!(dma.transfer_config().weight, Some(3));
        assert!(dma.transfer_config().access_ext_mem);

        let trans = backend.new_transaction().unwrap();
        let stash = trans.stash.as_ref().unwrap();
        assert_eq!((stash.size(), stash.alignment()), (128, 64));
    }

    #[test]
    fn test_external_alignment_from_channel() {
        let dma = LoopbackDma::new().with_ext_mem_alignment(128);
        let platform = LoopbackPlatform::new()
            .with_external_range(0x3C00_0000..0x3E00_0000)
            .with_cache_line(MemRegion::External, 32);
        let backend = Gdma::new(&McpConfig::default(), &dma, &platform).unwrap();
        assert_eq!(backend.tx_alignment().external, 128);
        assert_eq!(backend.rx_alignment().external, 128);
        assert_eq!(backend.max_single_dma_buffer(), 3968);

        let dma = LoopbackDma::new().with_ext_mem_alignment(8192);
        let platform = LoopbackPlatform::new().with_external_range(0x3C00_0000..0x3E00_0000);
        assert!(matches!(
            Gdma::new(&McpConfig::default(), &dma, &platform),
            Err(McpError::InvalidArgument)
        ));
    }

    #[test]
    fn test_source_alignment_checked() {
        let dma = LoopbackDma::new();
        let platform = LoopbackPlatform::new();
        let config = McpConfig::default().with_dma_burst_size(8);
        let backend = Gdma::new(&config, &dma, &platform).unwrap();
        let buf = 0x3FC8_0000 as *mut u8;
        assert!(backend.check_args(buf, buf, 64).is_ok());
        assert!(backend.check_args(buf.wrapping_add(1), buf, 64).is_ok());
        assert_eq!(
            backend.check_args(buf, buf.wrapping_add(1), 64),
            Err(McpError::InvalidArgument)
        );
        assert_eq!(backend.check_args(buf, buf, 63), Err(McpError::InvalidArgument));
    }

    #[test]
    fn test_external_rejected_without_psram() {
        let dma = LoopbackDma::new();
        let platform = LoopbackPlatform::new().with_forbidden_range(0x4200_0000..0x4400_0000);
        let backend = Gdma::new(&McpConfig::default(), &dma, &platform).unwrap();
        let flash = 0x4200_1000 as *mut u8;
        let sram = 0x3FC8_0000 as *mut u8;
        assert_eq!(backend.check_args(sram, flash, 16), Err(McpError::InvalidArgument));
    }

    #[test]
    fn test_split_chain_uses_stash() {
        let mut host = std::vec![0u8; 512];
        let base = host.as_mut_ptr() as usize;
        let dma = LoopbackDma::new();
        let platform = LoopbackPlatform::new()
            .with_external_range(base..base + 512)
            .with_cache_line(MemRegion::External, 32);
        let backend = Gdma::new(&McpConfig::default(), &dma, &platform).unwrap();

        let mut src = [7u8; 100];
        let offset = 32 - base % 32 + 3;
        let dst = host.as_mut_ptr().wrapping_add(offset);
        let mut trans = backend.new_transaction().unwrap();
        backend
            .prepare(&mut trans, dst, src.as_mut_ptr(), 100)
            .unwrap();

        assert_eq!((trans.split.head, trans.split.body, trans.split.tail), (29, 64, 7));
        let stash = trans.stash.as_ref().unwrap().as_ptr() as *mut u8;
        let rx = trans.rx.as_ref().unwrap();
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.node(0).unwrap().buffer, stash);
        assert_eq!(rx.node(1).unwrap().buffer, dst.wrapping_add(29));
        assert_eq!(trans.eof_node.buffer, stash.wrapping_add(32));
        assert_eq!(trans.eof_node.size(), 7);

        let body_invalidated = platform
            .msync_records()
            .iter()
            .any(|r| r.addr == dst as usize + 29 && r.flags == MsyncFlags::DIR_M2C);
        assert!(body_invalidated);
    }

    #[test]
    fn test_etm_forwarded() {
        let dma = LoopbackDma::new().with_etm();
        let platform = LoopbackPlatform::new();
        let backend = Gdma::new(&McpConfig::default(), &dma, &platform).unwrap();
        let event = backend.new_etm_event(McpEtmEvent::CopyDone).unwrap();
        assert_eq!(event.kind, crate::hal::DmaEtmEvent::EofReached);
    }
}
