//! CP-DMA 后端
//!
//! CP-DMA 只能访问内部 SRAM，不经过 cache，也没有对齐要求。
//! TX 链按 4095 字节切块，最后一个节点标记 EOF；RX 链以同样的方式
//! 切分目标缓冲区，最后一块放在事务的 EOF 节点上。

use crate::config::MEM2MEM_TRIGGER_ID;
use crate::error::{McpError, McpResult};
use crate::hal::{DmaChannel, DmaTrigger, EtmEvent, MemRegion, Platform, TransferConfig};
use crate::mcp::backend::McpBackend;
use crate::mcp::config::McpConfig;
use crate::mcp::etm::McpEtmEvent;
use crate::mcp::transaction::Transaction;
use crate::mem::cache::RxSplit;
use crate::mem::dma::{
    mount_buffers, node_count, BufferMount, LinkList, LinkListConfig,
    DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
};
use crate::util::log::*;

/// CP-DMA 后端
pub struct CpDma<C: DmaChannel, P: Platform> {
    channel: C,
    platform: P,
}

impl<C: DmaChannel, P: Platform> CpDma<C, P> {
    /// 连接并配置通道，使能完成中断
    pub fn new(config: &McpConfig, channel: C, platform: P) -> McpResult<Self> {
        if config.weight.is_some() {
            log_debug!("cp_dma: channel weight ignored");
        }
        channel.connect(DmaTrigger::Mem2Mem {
            id: MEM2MEM_TRIGGER_ID,
        })?;
        let backend = Self { channel, platform };
        backend.channel.config_transfer(&TransferConfig {
            max_data_burst_size: config.dma_burst_size,
            access_ext_mem: false,
            weight: None,
        })?;
        backend.channel.listen_rx_eof(true);
        Ok(backend)
    }

    fn is_internal(&self, addr: usize, n: usize) -> bool {
        self.platform.region(addr, n) == Some(MemRegion::Internal)
    }
}

impl<C: DmaChannel, P: Platform> McpBackend for CpDma<C, P> {
    const NAME: &'static str = "cp_dma";

    fn new_transaction(&self) -> McpResult<Transaction> {
        Ok(Transaction::new(None))
    }

    fn check_args(&self, dst: *mut u8, src: *const u8, n: usize) -> McpResult<()> {
        if !self.is_internal(src as usize, n) || !self.is_internal(dst as usize, n) {
            log_debug!("cp_dma: buffer not in internal memory");
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
        let max = DMA_DESCRIPTOR_BUFFER_MAX_SIZE;
        let nodes = node_count(n, max);

        let mut tx = LinkList::new(LinkListConfig {
            num_items: nodes,
            max_buffer_size: max,
        })?;
        mount_buffers(
            &mut tx,
            None,
            &[BufferMount::new(src as *mut u8, n).eof().last()],
        )?;

        let mut rx = LinkList::new(LinkListConfig {
            num_items: nodes - 1,
            max_buffer_size: max,
        })?;
        mount_buffers(
            &mut rx,
            Some(&mut trans.eof_node),
            &[BufferMount::new(dst, n).last()],
        )?;

        trans.tx = Some(tx);
        trans.rx = Some(rx);
        trans.split = RxSplit::new(dst, n, 1);
        trans.len = n;
        Ok(())
    }

    unsafe fn start(&self, trans: &Transaction) {
        self.channel.start(trans.tx_head(), trans.rx_head());
    }

    fn take_rx_eof(&self) -> Option<usize> {
        self.channel.take_rx_eof()
    }

    fn finish(&self, _trans: &mut Transaction) {}

    fn new_etm_event(&self, _event: McpEtmEvent) -> McpResult<EtmEvent> {
        Err(McpError::NotSupported)
    }
}

impl<C: DmaChannel, P: Platform> Drop for CpDma<C, P> {
    fn drop(&mut self) {
        self.channel.stop();
        self.channel.listen_rx_eof(false);
        self.channel.disconnect();
    }
}
