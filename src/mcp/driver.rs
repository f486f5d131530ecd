//! 异步 memcpy 驱动
//!
//! 数据流:
//!
//! ```text
//!   memcpy ──> acquire_idle ──> 构建描述符 ──> enqueue_ready ──> try_start_pending
//!                                                                   │ (Idle -> RunWait 的胜者)
//!                                                                   v
//!   on_interrupt <── 硬件完成 <── 启动硬件 <── Run <── dequeue_ready
//!       │
//!       └──> Run -> IdleWait ──> 回调 ──> 释放描述符 ──> release_to_idle ──> Idle ──> try_start_pending
//! ```
//!
//! 同一实例同一时刻只有一个事务在硬件上执行，完成顺序与提交顺序一致。
//!
//! # 时序约定
//!
//! 硬件在事务真正执行时才读取源缓冲区，而不是在 `memcpy` 返回时。
//! 回调触发前，源缓冲区必须保持不变，目标缓冲区的内容不可依赖。

use core::ffi::c_void;
use core::mem::offset_of;

use portable_atomic::{AtomicUsize, Ordering};

use crate::error::{McpError, McpResult};
use crate::hal::{DmaChannel, EtmEvent, Platform};
use crate::mcp::backend::McpBackend;
use crate::mcp::config::McpConfig;
use crate::mcp::cp_dma::CpDma;
use crate::mcp::etm::McpEtmEvent;
use crate::mcp::fsm::{Fsm, McpFsm};
use crate::mcp::gdma::Gdma;
use crate::mcp::transaction::{McpCallback, McpEvent, Transaction};
use crate::mem::pool::{PoolStats, SlotPool};
use crate::sync::{with_critical_section, AtomicCounter};
use crate::util::log::*;

const NO_TRANSACTION: usize = usize::MAX;

/// 异步 memcpy 驱动句柄
pub struct AsyncMemcpy<B: McpBackend> {
    // 先于事务池 drop: 通道停止后才释放描述符
    backend: B,
    pool: SlotPool<Transaction>,
    fsm: Fsm,
    current: AtomicUsize,
    completed: AtomicCounter,
}

/// 安装 CP-DMA 驱动
pub fn install_cpdma<C, P>(
    config: &McpConfig,
    channel: C,
    platform: P,
) -> McpResult<AsyncMemcpy<CpDma<C, P>>>
where
    C: DmaChannel,
    P: Platform,
{
    config.validate()?;
    let backend = CpDma::new(config, channel, platform)?;
    AsyncMemcpy::install(config, backend)
}

/// 安装 GDMA 驱动
pub fn install_gdma<C, P>(
    config: &McpConfig,
    channel: C,
    platform: P,
) -> McpResult<AsyncMemcpy<Gdma<C, P>>>
where
    C: DmaChannel,
    P: Platform,
{
    config.validate()?;
    let backend = Gdma::new(config, channel, platform)?;
    AsyncMemcpy::install(config, backend)
}

impl<B: McpBackend> AsyncMemcpy<B> {
    /// 以已初始化的后端安装驱动，预分配事务池
    pub fn install(config: &McpConfig, backend: B) -> McpResult<Self> {
        config.validate()?;
        let backlog = config.effective_backlog();
        let pool = SlotPool::new(backlog, |_| backend.new_transaction())?;
        log_info!("async memcpy ({}) installed, backlog {}", B::NAME, backlog);
        Ok(Self {
            backend,
            pool,
            fsm: Fsm::new(),
            current: AtomicUsize::new(NO_TRANSACTION),
            completed: AtomicCounter::new(),
        })
    }

    /// 卸载驱动
    ///
    /// 仍有事务未完成或引擎不空闲时返回 `InvalidState`，句柄原样交还。
    pub fn uninstall(self) -> Result<(), (Self, McpError)> {
        let stats = self.pool.stats();
        if self.fsm.load() != McpFsm::Idle || stats.in_use() != 0 {
            log_debug!("async memcpy busy, {} transactions outstanding", stats.in_use());
            return Err((self, McpError::InvalidState));
        }
        log_info!("async memcpy ({}) uninstalled", B::NAME);
        Ok(())
    }

    /// 提交一次异步拷贝
    ///
    /// 不会阻塞: 没有空闲事务时立即返回 `InvalidState`，由调用者重试。
    /// `callback` 在完成中断中执行。
    ///
    /// # Safety
    ///
    /// - `src` 在 `n` 字节内可读、`dst` 在 `n` 字节内可写，两者不重叠
    /// - 回调触发前，两块缓冲区都必须保持有效，源缓冲区不得修改，
    ///   目标缓冲区不得读写
    /// - `callback_arg` 在回调中使用时必须仍然有效
    pub unsafe fn memcpy(
        &self,
        dst: *mut u8,
        src: *const u8,
        n: usize,
        callback: Option<McpCallback>,
        callback_arg: *mut c_void,
    ) -> McpResult<()> {
        if dst.is_null() || src.is_null() || n == 0 {
            log_debug!("memcpy: invalid argument");
            return Err(McpError::InvalidArgument);
        }
        self.backend.check_args(dst, src, n)?;

        let Some(index) = self.pool.acquire_idle() else {
            log_trace!("memcpy: backlog exhausted");
            return Err(McpError::InvalidState);
        };

        // SAFETY: 刚从 idle 队列取出，当前持有者只有本调用
        let trans = self.pool.slot_mut(index);
        if let Err(e) = self.backend.prepare(trans, dst, src, n) {
            trans.recycle();
            self.pool.release_to_idle(index);
            return Err(e);
        }
        trans.cb = callback;
        trans.cb_arg = callback_arg;

        self.pool.enqueue_ready(index);
        self.try_start_pending();
        Ok(())
    }

    /// 引擎空闲时启动 ready 队列头部的事务
    ///
    /// 提交之后和每次完成之后都会调用，也可由调用者随时调用。
    pub fn try_start_pending(&self) {
        loop {
            if !self.fsm.transition(McpFsm::Idle, McpFsm::RunWait) {
                return;
            }
            match self.pool.dequeue_ready() {
                Some(index) => {
                    with_critical_section(|_cs| {
                        self.current.store(index, Ordering::Release);
                        self.fsm.store(McpFsm::Run);
                    });
                    // SAFETY: 事务已处于执行状态，描述符链在完成中断回收前不会被改动
                    unsafe { self.backend.start(self.pool.slot_mut(index)) };
                    return;
                }
                None => {
                    self.fsm.store(McpFsm::Idle);
                    // 回退到 Idle 的同时可能有事务入队，而入队方的 CAS 已经失败
                    if !self.pool.has_ready() {
                        return;
                    }
                }
            }
        }
    }

    /// 完成中断处理函数
    ///
    /// 由平台的 DMA 中断服务程序调用。返回 `true` 表示回调请求在
    /// 中断退出时让出 CPU。
    pub fn on_interrupt(&self) -> bool {
        let Some(eof_addr) = self.backend.take_rx_eof() else {
            return false;
        };

        let Some(index) = self
            .pool
            .index_of(eof_addr, offset_of!(Transaction, eof_node))
        else {
            debug_assert_msg!(false, "EOF descriptor {} has no transaction", eof_addr);
            log_error!("EOF descriptor {} has no transaction", eof_addr);
            return false;
        };

        if !self.fsm.transition(McpFsm::Run, McpFsm::IdleWait) {
            debug_assert_msg!(false, "completion in state {:?}", self.fsm.load());
            log_error!("unexpected completion, engine left idle");
            return false;
        }
        debug_assert_eq!(self.current.load(Ordering::Acquire), index);

        // SAFETY: IdleWait 状态下只有本中断持有当前事务
        let trans = unsafe { self.pool.slot_mut(index) };
        self.backend.finish(trans);

        let mut need_yield = false;
        if let Some(cb) = trans.cb.take() {
            let event = McpEvent { len: trans.len };
            need_yield = cb(&event, trans.cb_arg);
        }

        trans.recycle();
        self.completed.increment();
        self.pool.release_to_idle(index);
        // 状态与当前事务一起切换，snapshot 看不到中间态
        with_critical_section(|_cs| {
            self.current.store(NO_TRANSACTION, Ordering::Release);
            self.fsm.store(McpFsm::Idle);
        });

        self.try_start_pending();
        need_yield
    }

    /// 创建 ETM 事件
    pub fn new_etm_event(&self, event: McpEtmEvent) -> McpResult<EtmEvent> {
        self.backend.new_etm_event(event)
    }

    /// 引擎状态
    pub fn state(&self) -> McpFsm {
        self.fsm.load()
    }

    /// 当前事务的槽位索引
    pub fn current_transaction(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_TRANSACTION => None,
            index => Some(index),
        }
    }

    /// 在临界区内同时读取引擎状态与当前事务
    pub fn snapshot(&self) -> (McpFsm, Option<usize>) {
        with_critical_section(|_cs| (self.state(), self.current_transaction()))
    }

    /// 事务池统计
    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// 积压深度
    pub fn backlog(&self) -> usize {
        self.pool.capacity()
    }

    /// 已完成的事务数
    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    /// 后端
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
