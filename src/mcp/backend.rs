//! 后端接口
//!
//! CP-DMA 与 GDMA 共用同一个驱动 (事务池 + 状态机 + 完成中断)，
//! 差别只在描述符构建、对齐与 cache 处理上，由本 trait 抽象。

use crate::error::McpResult;
use crate::hal::EtmEvent;
use crate::mcp::etm::McpEtmEvent;
use crate::mcp::transaction::Transaction;

/// 内存拷贝后端
pub trait McpBackend {
    /// 后端名称
    const NAME: &'static str;

    /// 为槽位池创建一个事务 (安装时调用)
    fn new_transaction(&self) -> McpResult<Transaction>;

    /// 检查内存区域与对齐，在取出事务之前调用
    fn check_args(&self, dst: *mut u8, src: *const u8, n: usize) -> McpResult<()>;

    /// 构建描述符链并做传输前的 cache 维护
    ///
    /// 失败时事务可能已部分填充，调用者负责 `recycle`。
    fn prepare(
        &self,
        trans: &mut Transaction,
        dst: *mut u8,
        src: *const u8,
        n: usize,
    ) -> McpResult<()>;

    /// 启动事务
    ///
    /// # Safety
    ///
    /// 事务的描述符链必须已构建完成，且在完成中断被处理前保持不动。
    unsafe fn start(&self, trans: &Transaction);

    /// 应答完成中断，返回 EOF 描述符地址
    fn take_rx_eof(&self) -> Option<usize>;

    /// 传输完成后的收尾 (中断上下文)
    fn finish(&self, trans: &mut Transaction);

    /// 创建 ETM 事件
    fn new_etm_event(&self, event: McpEtmEvent) -> McpResult<EtmEvent>;
}
