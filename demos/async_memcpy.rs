//! 异步 memcpy 示例 - 软件回环 DMA
//!
//! 演示驱动的完整生命周期:
//! - 安装 GDMA 后端 (回环通道 + 软件内存映射)
//! - 连续提交多个拷贝，观察 FIFO 完成顺序
//! - 积压满时的 `InvalidState` 与重试
//! - 卸载
//!
//! # 运行
//! ```bash
//! cargo run --example async_memcpy
//! ```

use core::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};

use rustmcp::hal::{LoopbackDma, LoopbackPlatform};
use rustmcp::{install_gdma, McpConfig, McpError, McpEvent};

const COPIES: usize = 6;
const LEN: usize = 5000;

/// 完成回调: 在中断上下文中运行，只做计数
fn on_done(event: &McpEvent, arg: *mut c_void) -> bool {
    let done = unsafe { &*(arg as *const AtomicUsize) };
    let n = done.fetch_add(1, Ordering::Relaxed) + 1;
    println!("  copy #{n} done, {} bytes", event.len);
    false
}

fn main() {
    println!("Async memcpy demo ({} v{})", rustmcp::NAME, rustmcp::VERSION);

    let dma = LoopbackDma::new();
    let platform = LoopbackPlatform::new();
    let config = McpConfig::default().with_backlog(4);
    let Ok(mcp) = install_gdma(&config, &dma, &platform) else {
        println!("install failed");
        return;
    };
    println!("Installed, backlog {}", mcp.backlog());

    let sources: Vec<Vec<u8>> = (0..COPIES)
        .map(|i| (0..LEN).map(|b| (b as u8) ^ (i as u8)).collect())
        .collect();
    let mut targets = vec![vec![0u8; LEN]; COPIES];
    let done = AtomicUsize::new(0);
    let arg = &done as *const AtomicUsize as *mut c_void;

    println!("\n=== Submit ===");
    let mut next = 0;
    while next < COPIES {
        let dst = targets[next].as_mut_ptr();
        let src = sources[next].as_ptr();
        // 缓冲区在回调触发前一直有效且不被访问
        match unsafe { mcp.memcpy(dst, src, LEN, Some(on_done), arg) } {
            Ok(()) => {
                println!("  submitted #{}", next + 1);
                next += 1;
            }
            Err(McpError::InvalidState) => {
                // 积压已满: 让 "硬件" 跑完一个事务后重试
                println!("  backlog full, stats {:?}", mcp.pool_stats());
                if dma.process() {
                    mcp.on_interrupt();
                }
            }
            Err(e) => {
                println!("  submit failed: {e}");
                return;
            }
        }
    }

    println!("\n=== Drain ===");
    while dma.process() {
        mcp.on_interrupt();
    }

    let ok = sources.iter().zip(&targets).all(|(s, t)| s == t);
    println!("\nCompleted {} copies, data {}", mcp.completed(), if ok { "OK" } else { "MISMATCH" });

    match mcp.uninstall() {
        Ok(()) => println!("Uninstalled"),
        Err((_mcp, e)) => println!("uninstall failed: {e}"),
    };
}
