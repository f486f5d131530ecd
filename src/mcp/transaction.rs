//! 拷贝事务
//!
//! 事务在安装时一次性分配到槽位池中，之后反复在 idle -> ready -> 执行 -> idle
//! 之间循环。每次提交都重新分配 TX/RX 描述符链，完成后释放。
//!
//! RX 链的最后一个节点是嵌入在事务内部的 `eof_node`，硬件在这个节点上
//! 报告 EOF，中断处理函数据此反推出完成的事务。

use core::ffi::c_void;

use crate::mem::cache::RxSplit;
use crate::mem::dma::{DmaBuffer, DmaDescriptor, LinkList};

/// 拷贝完成事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct McpEvent {
    /// 拷贝的字节数
    pub len: usize,
}

/// 拷贝完成回调
///
/// 在中断上下文中执行，回调函数及其参数必须位于中断可访问的内存中。
/// 返回 `true` 表示唤醒了更高优先级的任务，中断退出时需要让出 CPU。
pub type McpCallback = fn(event: &McpEvent, arg: *mut c_void) -> bool;

/// 一次拷贝请求
#[repr(C)]
pub struct Transaction {
    /// RX 链的 EOF 节点
    pub eof_node: DmaDescriptor,
    /// TX (读) 描述符链
    pub tx: Option<LinkList>,
    /// RX (写) 描述符链，不含 `eof_node`
    pub rx: Option<LinkList>,
    /// 未对齐的 head/tail 暂存缓冲区 (GDMA)
    pub stash: Option<DmaBuffer>,
    /// 目标缓冲区拆分
    pub split: RxSplit,
    /// 拷贝长度
    pub len: usize,
    /// 完成回调
    pub cb: Option<McpCallback>,
    /// 回调参数 (不持有)
    pub cb_arg: *mut c_void,
}

// Safety: 裸指针只在事务的持有者 (提交方或完成中断) 手中被使用，
// 同一时刻只有一个持有者。
unsafe impl Send for Transaction {}

impl Transaction {
    /// 创建空事务
    pub fn new(stash: Option<DmaBuffer>) -> Self {
        Self {
            eof_node: DmaDescriptor::EMPTY,
            tx: None,
            rx: None,
            stash,
            split: RxSplit::EMPTY,
            len: 0,
            cb: None,
            cb_arg: core::ptr::null_mut(),
        }
    }

    /// TX 链头地址
    pub fn tx_head(&self) -> usize {
        self.tx.as_ref().map_or(0, LinkList::head_addr)
    }

    /// RX 链头地址
    ///
    /// 整个目标缓冲区只需一个节点时，链头就是 `eof_node`。
    pub fn rx_head(&self) -> usize {
        match &self.rx {
            Some(rx) if !rx.is_empty() => rx.head_addr(),
            _ => &self.eof_node as *const DmaDescriptor as usize,
        }
    }

    /// 释放描述符链，清空回调，准备放回 idle 队列
    ///
    /// 暂存缓冲区随事务保留。
    pub fn recycle(&mut self) {
        self.tx = None;
        self.rx = None;
        self.eof_node.reset();
        self.split = RxSplit::EMPTY;
        self.len = 0;
        self.cb = None;
        self.cb_arg = core::ptr::null_mut();
    }
}
