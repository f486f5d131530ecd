//! 同步原语封装
//!
//! 统一使用 CriticalSectionRawMutex，以确保在 ESP32 单核/双核环境下
//! 任务与中断之间的互斥正确性。

use embassy_sync::blocking_mutex::{raw::CriticalSectionRawMutex, Mutex};
use portable_atomic::{AtomicU64, Ordering};

/// 中断安全的阻塞互斥锁
///
/// `lock` 期间处于临界区 (关中断)，可同时在任务和 ISR 中调用。
/// 临界区内只能做指针/索引重链接这类极短的操作。
///
/// # Example
/// ```ignore
/// use core::cell::RefCell;
///
/// let shared: IsrSafeMutex<RefCell<u32>> = IsrSafeMutex::new(RefCell::new(0));
/// shared.lock(|v| *v.borrow_mut() += 1);
/// ```
pub type IsrSafeMutex<T> = Mutex<CriticalSectionRawMutex, T>;

/// 在临界区中执行闭包
///
/// 禁用中断确保原子性，适用于非常短的操作
///
/// # Warning
/// 临界区内不能执行任何异步操作或长时间计算
#[inline]
pub fn with_critical_section<R, F>(f: F) -> R
where
    F: FnOnce(critical_section::CriticalSection) -> R,
{
    critical_section::with(f)
}

/// 原子计数器 - 用于统计
pub struct AtomicCounter {
    count: AtomicU64,
}

impl AtomicCounter {
    /// 创建新的计数器
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    /// 增加并返回新值
    #[inline(always)]
    pub fn increment(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// 获取当前值
    #[inline(always)]
    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new()
    }
}
