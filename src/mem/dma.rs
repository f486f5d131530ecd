//! DMA 描述符与缓冲区管理
//!
//! 提供 DMA 链表描述符、链表 (link list) 构建以及 DMA 安全的对齐缓冲区。
//!
//! # 描述符格式
//!
//! ```text
//! dw0: [11:0] size   [23:12] length   [30] suc_eof   [31] owner
//! dw1: buffer 指针
//! dw2: next 指针 (null 表示链表结束)
//! ```
//!
//! 单个描述符最多描述 4095 字节 (size 字段 12 位)，更长的缓冲区
//! 会被拆分到多个节点上，除最后一个节点外每个节点都装满。
//!
//! # 示例
//!
//! ```rust,ignore
//! use rustmcp::mem::dma::{mount_buffers, BufferMount, LinkList, LinkListConfig};
//!
//! let mut list = LinkList::new(LinkListConfig { num_items: 2, max_buffer_size: 4095 })?;
//! mount_buffers(&mut list, None, &[BufferMount::new(src, 5000).eof().last()])?;
//! let head = list.head_addr();
//! ```

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::{self, NonNull};

use crate::error::{McpError, McpResult};

/// 单个描述符可描述的最大缓冲区长度 (字节)
pub const DMA_DESCRIPTOR_BUFFER_MAX_SIZE: usize = 4095;

bitfield::bitfield! {
    /// 描述符控制字
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct DmaDescriptorFlags(u32);
    impl Debug;

    u16;
    /// 缓冲区容量
    pub size, set_size: 11, 0;
    /// 有效数据长度
    pub length, set_length: 23, 12;
    /// 帧结束
    pub suc_eof, set_suc_eof: 30;
    /// 归属 (1 = DMA)
    pub owner, set_owner: 31;
}

/// 描述符归属
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// CPU 拥有，DMA 不会访问
    Cpu,
    /// DMA 拥有，CPU 不得修改
    Dma,
}

/// DMA 描述符 (用于链式 DMA)
#[repr(C, align(4))]
#[derive(Debug, Clone, Copy)]
pub struct DmaDescriptor {
    /// 控制字: size / length / suc_eof / owner
    pub flags: DmaDescriptorFlags,
    /// 缓冲区地址
    pub buffer: *mut u8,
    /// 下一个描述符的地址 (null 表示结束)
    pub next: *mut DmaDescriptor,
}

impl DmaDescriptor {
    /// 空描述符
    pub const EMPTY: Self = Self {
        flags: DmaDescriptorFlags(0),
        buffer: ptr::null_mut(),
        next: ptr::null_mut(),
    };

    /// 创建新的描述符
    pub const fn new() -> Self {
        Self::EMPTY
    }

    /// 清空描述符
    pub fn reset(&mut self) {
        *self = Self::EMPTY;
    }

    /// 设置缓冲区
    pub fn set_buffer(&mut self, ptr: *mut u8, size: usize) {
        self.buffer = ptr;
        self.set_size(size);
        self.set_length(size);
    }

    /// 缓冲区容量
    pub fn size(&self) -> usize {
        self.flags.size() as usize
    }

    /// 设置缓冲区容量
    pub fn set_size(&mut self, size: usize) {
        debug_assert!(size <= DMA_DESCRIPTOR_BUFFER_MAX_SIZE);
        self.flags.set_size(size as u16);
    }

    /// 有效数据长度 (RX 方向由硬件回写)
    pub fn length(&self) -> usize {
        self.flags.length() as usize
    }

    /// 设置有效数据长度
    pub fn set_length(&mut self, length: usize) {
        debug_assert!(length <= DMA_DESCRIPTOR_BUFFER_MAX_SIZE);
        self.flags.set_length(length as u16);
    }

    /// 链接到下一个描述符
    pub fn link_to(&mut self, next: *mut DmaDescriptor) {
        self.next = next;
    }

    /// 标记 / 清除 EOF
    pub fn set_eof(&mut self, eof: bool) {
        self.flags.set_suc_eof(eof);
    }

    /// 是否为帧结束节点
    pub fn is_eof(&self) -> bool {
        self.flags.suc_eof()
    }

    /// 设置归属
    pub fn set_owner(&mut self, owner: Owner) {
        self.flags.set_owner(owner == Owner::Dma);
    }

    /// 交给 DMA
    pub fn set_owner_dma(&mut self) {
        self.set_owner(Owner::Dma);
    }

    /// 当前归属
    pub fn owner(&self) -> Owner {
        if self.flags.owner() {
            Owner::Dma
        } else {
            Owner::Cpu
        }
    }

    /// 检查 DMA 是否完成 (CPU 拥有描述符)
    pub fn is_complete(&self) -> bool {
        self.owner() == Owner::Cpu
    }
}

impl Default for DmaDescriptor {
    fn default() -> Self {
        Self::EMPTY
    }
}

/// 计算描述 `len` 字节需要的节点数
pub const fn node_count(len: usize, max_buffer_size: usize) -> usize {
    len.div_ceil(max_buffer_size)
}

/// 链表配置
#[derive(Debug, Clone, Copy)]
pub struct LinkListConfig {
    /// 节点数量
    pub num_items: usize,
    /// 单节点最大缓冲区长度
    pub max_buffer_size: usize,
}

/// DMA 描述符链表
///
/// 节点数组在创建时一次性分配，之后地址保持不变，可以安全地交给硬件。
pub struct LinkList {
    nodes: Vec<DmaDescriptor>,
    max_buffer_size: usize,
}

impl LinkList {
    /// 分配链表
    ///
    /// 节点内存不足时返回 `OutOfMemory`。
    pub fn new(config: LinkListConfig) -> McpResult<Self> {
        if config.max_buffer_size == 0 || config.max_buffer_size > DMA_DESCRIPTOR_BUFFER_MAX_SIZE {
            return Err(McpError::InvalidArgument);
        }
        let mut nodes = Vec::new();
        nodes
            .try_reserve_exact(config.num_items)
            .map_err(|_| McpError::OutOfMemory)?;
        nodes.resize(config.num_items, DmaDescriptor::EMPTY);
        Ok(Self {
            nodes,
            max_buffer_size: config.max_buffer_size,
        })
    }

    /// 节点数量
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// 是否没有节点
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// 单节点最大缓冲区长度
    pub fn max_buffer_size(&self) -> usize {
        self.max_buffer_size
    }

    /// 头节点地址 (空链表返回 0)
    pub fn head_addr(&self) -> usize {
        if self.nodes.is_empty() {
            0
        } else {
            self.nodes.as_ptr() as usize
        }
    }

    /// 获取节点
    pub fn node(&self, index: usize) -> Option<&DmaDescriptor> {
        self.nodes.get(index)
    }
}

/// 待挂载到链表上的缓冲区
#[derive(Debug, Clone, Copy)]
pub struct BufferMount {
    /// 缓冲区起始地址
    pub buffer: *mut u8,
    /// 缓冲区长度
    pub length: usize,
    /// 在该缓冲区的最后一个节点上标记 EOF
    pub mark_eof: bool,
    /// 该缓冲区的最后一个节点结束整条链
    pub mark_final: bool,
}

impl BufferMount {
    /// 创建挂载项
    pub const fn new(buffer: *mut u8, length: usize) -> Self {
        Self {
            buffer,
            length,
            mark_eof: false,
            mark_final: false,
        }
    }

    /// 标记 EOF
    pub const fn eof(mut self) -> Self {
        self.mark_eof = true;
        self
    }

    /// 标记为链表末尾
    pub const fn last(mut self) -> Self {
        self.mark_final = true;
        self
    }
}

/// 把缓冲区挂载到描述符链上
///
/// 依次把每个缓冲区按 `max_buffer_size` 切块写入节点。若给出 `tail`，
/// 它作为整条链的最后一个节点 (不属于 `list`)。节点总数必须与
/// 切块数一致，否则返回 `InvalidArgument`。
pub fn mount_buffers(
    list: &mut LinkList,
    tail: Option<&mut DmaDescriptor>,
    buffers: &[BufferMount],
) -> McpResult<()> {
    let max = list.max_buffer_size;
    let needed: usize = buffers.iter().map(|b| node_count(b.length, max)).sum();
    let available = list.nodes.len() + usize::from(tail.is_some());
    if needed == 0 || needed != available {
        return Err(McpError::InvalidArgument);
    }

    let base = list.nodes.as_mut_ptr();
    let count = list.nodes.len();
    let tail = tail.map_or(ptr::null_mut(), |t| t as *mut DmaDescriptor);
    let node_at = |i: usize| -> *mut DmaDescriptor {
        if i < count {
            // SAFETY: i < count
            unsafe { base.add(i) }
        } else {
            tail
        }
    };

    let mut index = 0;
    for mount in buffers.iter().filter(|m| m.length > 0) {
        let mut offset = 0;
        while offset < mount.length {
            let chunk = usize::min(max, mount.length - offset);
            let last_chunk = offset + chunk == mount.length;
            let next = if (last_chunk && mount.mark_final) || index + 1 == needed {
                ptr::null_mut()
            } else {
                node_at(index + 1)
            };

            // SAFETY: index < needed == available，node_at 返回链表内节点或 tail
            let node = unsafe { &mut *node_at(index) };
            node.reset();
            // SAFETY: offset < mount.length，仍在调用者给出的缓冲区内
            node.set_buffer(unsafe { mount.buffer.add(offset) }, chunk);
            node.set_eof(last_chunk && mount.mark_eof);
            node.link_to(next);
            node.set_owner_dma();

            offset += chunk;
            index += 1;
        }
    }

    Ok(())
}

/// DMA 缓冲区
///
/// 运行时指定大小和对齐的堆缓冲区 (清零)，drop 时释放。
/// 用作 GDMA 的 cache line 暂存缓冲区。
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl DmaBuffer {
    /// 分配缓冲区
    pub fn new(size: usize, align: usize) -> McpResult<Self> {
        if size == 0 {
            return Err(McpError::InvalidArgument);
        }
        let layout =
            Layout::from_size_align(size, align.max(1)).map_err(|_| McpError::InvalidArgument)?;
        // SAFETY: layout 大小非零
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr)
            .map(|ptr| Self { ptr, layout })
            .ok_or(McpError::OutOfMemory)
    }

    /// 获取缓冲区大小
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// 获取对齐要求
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    /// 获取数据指针
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// 获取可变数据指针
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// 获取数据切片
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr 指向 size 字节的已初始化内存
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.size()) }
    }

    /// 获取可变数据切片
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: 同上，且 &mut self 保证独占
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size()) }
    }

    /// 填充缓冲区
    pub fn fill(&mut self, value: u8) {
        self.as_mut_slice().fill(value);
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr 由同一个 layout 的 alloc_zeroed 分配
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

// Safety: DmaBuffer 独占其堆内存
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

/// 向下对齐
pub const fn align_down(value: usize, alignment: usize) -> usize {
    value & !(alignment - 1)
}

/// 检查是否对齐 (`alignment` 为 0 或 1 时总是对齐)
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    alignment <= 1 || value & (alignment - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_down(4095, 64), 4032);
        assert!(is_aligned(0x40, 64));
        assert!(!is_aligned(0x41, 4));
        assert!(is_aligned(0x41, 1));
    }

    #[test]
    fn test_node_count() {
        assert_eq!(node_count(1, 4095), 1);
        assert_eq!(node_count(4095, 4095), 1);
        assert_eq!(node_count(4096, 4095), 2);
        assert_eq!(node_count(16384, 4095), 5);
        assert_eq!(node_count(0, 4095), 0);
    }

    #[test]
    fn test_descriptor_flags() {
        let mut desc = DmaDescriptor::new();
        desc.set_size(4095);
        desc.set_length(17);
        desc.set_eof(true);
        desc.set_owner_dma();
        assert_eq!(desc.size(), 4095);
        assert_eq!(desc.length(), 17);
        assert!(desc.is_eof());
        assert!(!desc.is_complete());

        desc.set_owner(Owner::Cpu);
        desc.set_eof(false);
        assert!(desc.is_complete());
        assert!(!desc.is_eof());
        assert_eq!(desc.size(), 4095);
    }

    #[test]
    fn test_descriptor_flags_layout() {
        let mut flags = DmaDescriptorFlags(0);
        flags.set_size(0xFFF);
        assert_eq!(flags.0, 0x0000_0FFF);
        flags.set_length(1);
        assert_eq!(flags.0, 0x0000_1FFF);
        flags.set_suc_eof(true);
        flags.set_owner(true);
        assert_eq!(flags.0, 0xC000_1FFF);

        let mut desc = DmaDescriptor::new();
        desc.set_buffer(core::ptr::null_mut(), 100);
        desc.set_owner_dma();
        assert_eq!(desc.flags.0, (1 << 31) | (100 << 12) | 100);
    }

    #[test]
    fn test_link_list_out_of_memory() {
        let result = LinkList::new(LinkListConfig {
            num_items: usize::MAX,
            max_buffer_size: DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
        });
        assert_eq!(result.err(), Some(McpError::OutOfMemory));
    }

    #[test]
    fn test_mount_splits_into_max_chunks() {
        let mut data = [0u8; 10_000];
        let mut list = LinkList::new(LinkListConfig {
            num_items: 3,
            max_buffer_size: DMA_DESCRIPTOR_BUFFER_MAX_SIZE,
        })
        .unwrap();
        mount_buffers(
            &mut list,
            None,
            &[BufferMount::new(data.as_mut_ptr(), data.len()).eof().last()],
        )
        .unwrap();

        let sizes: Vec<usize> = (0..3).map(|i| list.node(i).unwrap().size()).collect();
        assert_eq!(sizes, [4095, 4095, 1810]);
        assert!(!list.node(0).unwrap().is_eof());
        assert!(list.node(2).unwrap().is_eof());
        assert!(list.node(2).unwrap().next.is_null());
        assert_eq!(list.node(0).unwrap().next as usize, list.head_addr() + core::mem::size_of::<DmaDescriptor>());
        assert_eq!(list.node(1).unwrap().buffer as usize, data.as_ptr() as usize + 4095);
    }

    #[test]
    fn test_mount_with_tail_node() {
        let mut head = [0u8; 8];
        let mut body = [0u8; 64];
        let mut list = LinkList::new(LinkListConfig {
            num_items: 1,
            max_buffer_size: 4095,
        })
        .unwrap();
        let mut tail = DmaDescriptor::EMPTY;
        mount_buffers(
            &mut list,
            Some(&mut tail),
            &[
                BufferMount::new(head.as_mut_ptr(), head.len()),
                BufferMount::new(core::ptr::null_mut(), 0),
                BufferMount::new(body.as_mut_ptr(), body.len()).last(),
            ],
        )
        .unwrap();

        assert_eq!(list.node(0).unwrap().next, &mut tail as *mut DmaDescriptor);
        assert_eq!(tail.size(), 64);
        assert!(tail.next.is_null());
        assert_eq!(tail.owner(), Owner::Dma);
    }

    #[test]
    fn test_mount_rejects_wrong_node_count() {
        let mut data = [0u8; 5000];
        let mut list = LinkList::new(LinkListConfig {
            num_items: 1,
            max_buffer_size: 4095,
        })
        .unwrap();
        let result = mount_buffers(&mut list, None, &[BufferMount::new(data.as_mut_ptr(), data.len())]);
        assert_eq!(result, Err(McpError::InvalidArgument));
    }

    #[test]
    fn test_dma_buffer_alignment() {
        let mut buf = DmaBuffer::new(100, 64).unwrap();
        assert_eq!(buf.size(), 100);
        assert_eq!(buf.as_ptr() as usize % 64, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.fill(0x5A);
        assert!(buf.as_slice().iter().all(|&b| b == 0x5A));
        assert_eq!(DmaBuffer::new(0, 4).err(), Some(McpError::InvalidArgument));
    }
}
