//! 引擎状态机
//!
//! ```text
//!   Idle ──CAS──> RunWait ──(ready 队列有事务)──> Run
//!    ^              │                              │
//!    │              └──(ready 队列为空)── Idle      CAS (完成中断)
//!    │                                             v
//!    └──────────────(回收完成)──────────────── IdleWait
//! ```
//!
//! 两个 WAIT 状态表示 "正在从队列取事务并编程硬件" 与 "正在回收刚完成的事务"，
//! 期间其它 try-start 调用者的 CAS 都会失败，因此不需要在这些步骤上持锁。

use portable_atomic::{AtomicU8, Ordering};

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum McpFsm {
    /// 空闲
    Idle = 0,
    /// Idle -> Run 进行中
    RunWait = 1,
    /// 硬件正在执行当前事务
    Run = 2,
    /// Run -> Idle 进行中
    IdleWait = 3,
}

impl McpFsm {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::RunWait,
            2 => Self::Run,
            3 => Self::IdleWait,
            _ => Self::Idle,
        }
    }
}

/// 原子状态字
pub struct Fsm(AtomicU8);

impl Fsm {
    /// 初始状态为 Idle
    pub const fn new() -> Self {
        Self(AtomicU8::new(McpFsm::Idle as u8))
    }

    /// 读取当前状态
    #[inline]
    pub fn load(&self) -> McpFsm {
        McpFsm::from_raw(self.0.load(Ordering::Acquire))
    }

    /// 无条件写入状态 (只能由 WAIT 状态的持有者调用)
    #[inline]
    pub fn store(&self, state: McpFsm) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// CAS: 当前为 `from` 时切换到 `to`，成功返回 `true`
    #[inline]
    pub fn transition(&self, from: McpFsm, to: McpFsm) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Self::new()
    }
}
