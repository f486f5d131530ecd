//! 事务槽位池
//!
//! 固定容量的槽位数组 (arena) + 两条 FIFO 队列:
//! - idle 队列: 可用于新请求的槽位
//! - ready 队列: 已提交、等待硬件启动的槽位
//!
//! 槽位在创建时一次性分配，之后只在队列之间转移，热路径上没有内存分配。
//! 队列以索引链表实现，所有重链接操作都在同一个中断安全临界区内完成，
//! 临界区内只做索引重链接。
//!
//! # 槽位状态
//!
//! ```text
//!   Idle ──acquire_idle──> Reserved ──enqueue_ready──> Ready
//!    ^                        │                          │
//!    │                        └──release_to_idle──┐      dequeue_ready
//!    │                                            v      v
//!    └──────────────release_to_idle─────────── Executing
//! ```
//!
//! 任意时刻 `idle + reserved + ready + executing == capacity`。
//!
//! # 示例
//!
//! ```rust,ignore
//! let pool: SlotPool<u32> = SlotPool::new(4, |_| Ok(0))?;
//! let index = pool.acquire_idle().unwrap();
//! unsafe { *pool.slot_mut(index) = 42 };
//! pool.enqueue_ready(index);
//! assert_eq!(pool.dequeue_ready(), Some(index));
//! pool.release_to_idle(index);
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::{RefCell, UnsafeCell};

use crate::error::{McpError, McpResult};
use crate::sync::IsrSafeMutex;
use crate::util::log::*;

/// 槽位状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum SlotState {
    /// 在 idle 队列中
    Idle,
    /// 已被提交方取出，正在构建
    Reserved,
    /// 在 ready 队列中
    Ready,
    /// 正在被硬件执行
    Executing,
}

/// 槽位池统计
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// 总容量
    pub capacity: usize,
    /// idle 队列长度
    pub idle: usize,
    /// 被提交方暂时持有的数量
    pub reserved: usize,
    /// ready 队列长度
    pub ready: usize,
    /// 正在执行的数量 (0 或 1)
    pub executing: usize,
}

impl PoolStats {
    /// 已被占用 (非 idle) 的数量
    pub fn in_use(&self) -> usize {
        self.capacity - self.idle
    }

    /// 各状态数量之和是否等于容量
    pub fn is_conserved(&self) -> bool {
        self.idle + self.reserved + self.ready + self.executing == self.capacity
    }
}

/// 索引链表 FIFO
#[derive(Debug, Default)]
struct Fifo {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl Fifo {
    fn push_back(&mut self, links: &mut [Option<usize>], index: usize) {
        links[index] = None;
        match self.tail {
            Some(tail) => links[tail] = Some(index),
            None => self.head = Some(index),
        }
        self.tail = Some(index);
        self.len += 1;
    }

    fn pop_front(&mut self, links: &mut [Option<usize>]) -> Option<usize> {
        let index = self.head?;
        self.head = links[index].take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(index)
    }
}

struct Queues {
    idle: Fifo,
    ready: Fifo,
    links: Vec<Option<usize>>,
    states: Vec<SlotState>,
}

impl Queues {
    fn count(&self, state: SlotState) -> usize {
        self.states.iter().filter(|&&s| s == state).count()
    }
}

/// 固定容量槽位池
pub struct SlotPool<T> {
    slots: Box<[UnsafeCell<T>]>,
    queues: IsrSafeMutex<RefCell<Queues>>,
}

// Safety: 每个槽位在任一时刻只属于一个持有者 (某条队列、提交方或硬件)，
// 只有持有者才会访问槽位内容；队列本身由临界区保护。
unsafe impl<T: Send> Send for SlotPool<T> {}
unsafe impl<T: Send> Sync for SlotPool<T> {}

impl<T> SlotPool<T> {
    /// 创建槽位池，`init` 为每个槽位构造初始值
    ///
    /// 所有槽位初始位于 idle 队列，按索引顺序排列。
    pub fn new<F>(capacity: usize, mut init: F) -> McpResult<Self>
    where
        F: FnMut(usize) -> McpResult<T>,
    {
        if capacity == 0 {
            return Err(McpError::InvalidArgument);
        }

        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| McpError::OutOfMemory)?;
        for index in 0..capacity {
            slots.push(UnsafeCell::new(init(index)?));
        }

        let mut links = Vec::new();
        links
            .try_reserve_exact(capacity)
            .map_err(|_| McpError::OutOfMemory)?;
        links.resize(capacity, None);

        let mut states = Vec::new();
        states
            .try_reserve_exact(capacity)
            .map_err(|_| McpError::OutOfMemory)?;
        states.resize(capacity, SlotState::Idle);

        let mut idle = Fifo::default();
        for index in 0..capacity {
            idle.push_back(&mut links, index);
        }

        Ok(Self {
            slots: slots.into_boxed_slice(),
            queues: IsrSafeMutex::new(RefCell::new(Queues {
                idle,
                ready: Fifo::default(),
                links,
                states,
            })),
        })
    }

    /// 总容量
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 从 idle 队列头部取出一个槽位
    ///
    /// 队列为空时返回 `None`，这是正常的运行时状况 (积压已满)。
    pub fn acquire_idle(&self) -> Option<usize> {
        self.queues.lock(|q| {
            let q = &mut *q.borrow_mut();
            let index = q.idle.pop_front(&mut q.links)?;
            q.states[index] = SlotState::Reserved;
            Some(index)
        })
    }

    /// 把槽位放回 idle 队列尾部 (可在中断中调用)
    pub fn release_to_idle(&self, index: usize) {
        self.queues.lock(|q| {
            let q = &mut *q.borrow_mut();
            match q.states[index] {
                SlotState::Reserved | SlotState::Executing => {
                    q.idle.push_back(&mut q.links, index);
                    q.states[index] = SlotState::Idle;
                }
                SlotState::Idle | SlotState::Ready => {
                    debug_assert_msg!(false, "slot {} is not held by the caller", index);
                    log_error!("slot {} released twice", index);
                }
            }
        })
    }

    /// 把已构建完成的槽位放入 ready 队列尾部
    pub fn enqueue_ready(&self, index: usize) {
        self.queues.lock(|q| {
            let q = &mut *q.borrow_mut();
            debug_assert_eq!(q.states[index], SlotState::Reserved);
            q.ready.push_back(&mut q.links, index);
            q.states[index] = SlotState::Ready;
        })
    }

    /// 从 ready 队列头部取出一个槽位，标记为执行中 (可在中断中调用)
    pub fn dequeue_ready(&self) -> Option<usize> {
        self.queues.lock(|q| {
            let q = &mut *q.borrow_mut();
            let index = q.ready.pop_front(&mut q.links)?;
            q.states[index] = SlotState::Executing;
            Some(index)
        })
    }

    /// ready 队列是否非空
    pub fn has_ready(&self) -> bool {
        self.queues.lock(|q| q.borrow().ready.len > 0)
    }

    /// 槽位当前状态
    pub fn state_of(&self, index: usize) -> Option<SlotState> {
        self.queues.lock(|q| q.borrow().states.get(index).copied())
    }

    /// 获取统计信息
    pub fn stats(&self) -> PoolStats {
        self.queues.lock(|q| {
            let q = q.borrow();
            PoolStats {
                capacity: self.slots.len(),
                idle: q.idle.len,
                reserved: q.count(SlotState::Reserved),
                ready: q.ready.len,
                executing: q.count(SlotState::Executing),
            }
        })
    }

    /// 槽位原始指针
    pub fn slot_ptr(&self, index: usize) -> *mut T {
        self.slots[index].get()
    }

    /// 访问槽位内容
    ///
    /// # Safety
    ///
    /// 调用者必须是该槽位的当前持有者 (刚从队列取出、尚未放回)，
    /// 且不存在其它对该槽位的引用。
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slot_mut(&self, index: usize) -> &mut T {
        &mut *self.slots[index].get()
    }

    /// 由槽位内某个字段的地址反推槽位索引
    ///
    /// `field_offset` 为字段在 `T` 内的偏移 (`core::mem::offset_of!`)。
    /// 地址不对应任何槽位的该字段时返回 `None`。
    pub fn index_of(&self, addr: usize, field_offset: usize) -> Option<usize> {
        let stride = core::mem::size_of::<UnsafeCell<T>>();
        if stride == 0 {
            return None;
        }
        let base = self.slots.as_ptr() as usize;
        let rel = addr.checked_sub(base)?.checked_sub(field_offset)?;
        if rel % stride != 0 {
            return None;
        }
        let index = rel / stride;
        (index < self.slots.len()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    #[repr(C)]
    struct Item {
        _pad: u64,
        marker: u32,
    }

    fn pool(capacity: usize) -> SlotPool<Item> {
        SlotPool::new(capacity, |_| Ok(Item::default())).unwrap()
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = SlotPool::<Item>::new(0, |_| Ok(Item::default()));
        assert!(matches!(result, Err(McpError::InvalidArgument)));
    }

    #[test]
    fn test_init_error_propagates() {
        let result = SlotPool::<Item>::new(3, |i| {
            if i == 2 {
                Err(McpError::OutOfMemory)
            } else {
                Ok(Item::default())
            }
        });
        assert!(matches!(result, Err(McpError::OutOfMemory)));
    }

    #[test]
    fn test_slot_allocation_failure() {
        let mut constructed = 0;
        let result = SlotPool::<Item>::new(usize::MAX, |_| {
            constructed += 1;
            Ok(Item::default())
        });
        assert!(matches!(result, Err(McpError::OutOfMemory)));
        assert_eq!(constructed, 0);
    }

    #[test]
    fn test_idle_fifo_order() {
        let pool = pool(3);
        assert_eq!(pool.acquire_idle(), Some(0));
        assert_eq!(pool.acquire_idle(), Some(1));
        assert_eq!(pool.acquire_idle(), Some(2));
        assert_eq!(pool.acquire_idle(), None);

        pool.release_to_idle(1);
        pool.release_to_idle(0);
        assert_eq!(pool.acquire_idle(), Some(1));
        assert_eq!(pool.acquire_idle(), Some(0));
    }

    #[test]
    fn test_ready_fifo_order() {
        let pool = pool(4);
        let a = pool.acquire_idle().unwrap();
        let b = pool.acquire_idle().unwrap();
        let c = pool.acquire_idle().unwrap();
        pool.enqueue_ready(b);
        pool.enqueue_ready(a);
        pool.enqueue_ready(c);
        assert!(pool.has_ready());
        assert_eq!(pool.dequeue_ready(), Some(b));
        assert_eq!(pool.dequeue_ready(), Some(a));
        assert_eq!(pool.dequeue_ready(), Some(c));
        assert_eq!(pool.dequeue_ready(), None);
        assert!(!pool.has_ready());
    }

    #[test]
    fn test_stats_conserved() {
        let pool = pool(4);
        let a = pool.acquire_idle().unwrap();
        let b = pool.acquire_idle().unwrap();
        pool.enqueue_ready(a);
        let stats = pool.stats();
        assert_eq!(
            stats,
            PoolStats {
                capacity: 4,
                idle: 2,
                reserved: 1,
                ready: 1,
                executing: 0,
            }
        );
        assert!(stats.is_conserved());

        pool.enqueue_ready(b);
        assert_eq!(pool.dequeue_ready(), Some(a));
        assert_eq!(pool.state_of(a), Some(SlotState::Executing));
        let stats = pool.stats();
        assert_eq!((stats.ready, stats.executing, stats.in_use()), (1, 1, 2));
        assert!(stats.is_conserved());

        pool.release_to_idle(a);
        assert_eq!(pool.state_of(a), Some(SlotState::Idle));
        assert_eq!(pool.stats().idle, 3);
    }

    #[test]
    fn test_index_of_field() {
        let pool = pool(3);
        let offset = core::mem::offset_of!(Item, marker);
        for index in 0..3 {
            let addr = unsafe { core::ptr::addr_of!((*pool.slot_ptr(index)).marker) } as usize;
            assert_eq!(pool.index_of(addr, offset), Some(index));
        }
        let base = pool.slot_ptr(0) as usize;
        assert_eq!(pool.index_of(base + offset + 1, offset), None);
        assert_eq!(pool.index_of(base, offset), None);
        let past_end = pool.slot_ptr(2) as usize + core::mem::size_of::<Item>() + offset;
        assert_eq!(pool.index_of(past_end, offset), None);
    }

    #[test]
    fn test_slot_access() {
        let pool = pool(2);
        let index = pool.acquire_idle().unwrap();
        unsafe { pool.slot_mut(index).marker = 7 };
        assert_eq!(unsafe { pool.slot_mut(index).marker }, 7);
    }
}
