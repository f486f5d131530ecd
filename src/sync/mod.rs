//! 同步原语模块
//!
//! 提供驱动内部使用的同步原语，基于 embassy-sync / critical-section 封装:
//! - `IsrSafeMutex`: 可在任务和中断上下文中使用的阻塞互斥锁
//! - `AtomicCounter`: 统计计数器

pub mod primitives;

pub use primitives::{with_critical_section, AtomicCounter, IsrSafeMutex};
