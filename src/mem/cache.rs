//! Cache 一致性辅助
//!
//! DMA 直接访问物理内存，绕过 CPU 数据 cache:
//! - DMA 读取前，源缓冲区必须写回 (C2M)
//! - DMA 写入后，目标缓冲区必须失效 (M2C)
//!
//! 失效以 cache line 为粒度，若目标缓冲区首尾没有对齐到 cache line，
//! 直接失效会破坏相邻数据。因此目标缓冲区被拆成三段:
//!
//! ```text
//!   dst ─┬─ head (未对齐) ──> 暂存缓冲区 [0 .. align)
//!        ├─ body (对齐)   ──> 直接写入 dst
//!        └─ tail (未对齐) ──> 暂存缓冲区 [align .. 2*align)
//! ```
//!
//! 传输完成后再把 head/tail 从暂存缓冲区合并回 dst。

use crate::mem::dma::align_down;

bitflags::bitflags! {
    /// cache 同步标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsyncFlags: u32 {
        /// cache -> 内存 (写回)
        const DIR_C2M = 1 << 0;
        /// 内存 -> cache (失效)
        const DIR_M2C = 1 << 1;
        /// 允许地址/长度不对齐 (由实现补齐到整 cache line)
        const UNALIGNED = 1 << 3;
    }
}

/// 目标缓冲区的 head/body/tail 拆分结果
#[derive(Debug, Clone, Copy)]
pub struct RxSplit {
    /// 调用者的目标缓冲区
    pub dst: *mut u8,
    /// 未对齐的头部长度
    pub head: usize,
    /// 对齐的主体长度
    pub body: usize,
    /// 未对齐的尾部长度
    pub tail: usize,
    /// 拆分使用的对齐
    pub align: usize,
}

impl RxSplit {
    /// 空拆分
    pub const EMPTY: Self = Self {
        dst: core::ptr::null_mut(),
        head: 0,
        body: 0,
        tail: 0,
        align: 1,
    };

    /// 按 `align` 拆分 `[dst, dst + len)`
    ///
    /// `align <= 1` 时不拆分，全部归入 body。
    pub fn new(dst: *mut u8, len: usize, align: usize) -> Self {
        if align <= 1 {
            return Self {
                dst,
                head: 0,
                body: len,
                tail: 0,
                align: 1,
            };
        }
        let misalign = dst as usize & (align - 1);
        let head = usize::min(len, (align - misalign) & (align - 1));
        let body = align_down(len - head, align);
        let tail = len - head - body;
        Self {
            dst,
            head,
            body,
            tail,
            align,
        }
    }

    /// 总长度
    pub fn len(&self) -> usize {
        self.head + self.body + self.tail
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否需要暂存缓冲区
    pub fn needs_stash(&self) -> bool {
        self.head > 0 || self.tail > 0
    }

    /// body 起始地址
    pub fn body_ptr(&self) -> *mut u8 {
        self.dst.wrapping_add(self.head)
    }

    /// 把暂存缓冲区中的 head/tail 合并回目标缓冲区
    ///
    /// # Safety
    ///
    /// `dst` 在 `len()` 字节内必须可写，且传输已经完成。
    /// `stash` 至少 `2 * align` 字节。
    pub unsafe fn merge(&self, stash: &[u8]) {
        debug_assert!(stash.len() >= 2 * self.align || !self.needs_stash());
        if self.head > 0 {
            core::ptr::copy_nonoverlapping(stash.as_ptr(), self.dst, self.head);
        }
        if self.tail > 0 {
            core::ptr::copy_nonoverlapping(
                stash.as_ptr().add(self.align),
                self.dst.add(self.head + self.body),
                self.tail,
            );
        }
    }
}
