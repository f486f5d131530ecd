//! 异步内存拷贝引擎
//!
//! 在 CP-DMA 或一对 GDMA 通道上实现非阻塞的 memcpy:
//! - `config`: 安装配置
//! - `fsm`: 引擎状态机 (Idle / RunWait / Run / IdleWait)
//! - `transaction`: 事务与完成回调
//! - `backend`: 后端接口，`cp_dma` / `gdma` 两种实现
//! - `driver`: 驱动句柄，提交 API 与完成中断
//! - `etm`: ETM 事件
//!
//! # 示例
//!
//! ```rust,ignore
//! fn done(event: &McpEvent, _arg: *mut c_void) -> bool {
//!     log_info!("copied {} bytes", event.len);
//!     false
//! }
//!
//! let mcp = install_gdma(&McpConfig::default().with_backlog(8), channel, platform)?;
//! unsafe { mcp.memcpy(dst, src, len, Some(done), core::ptr::null_mut())? };
//!
//! // DMA 中断服务程序中
//! let need_yield = mcp.on_interrupt();
//! ```

pub mod backend;
pub mod config;
pub mod cp_dma;
pub mod driver;
pub mod etm;
pub mod fsm;
pub mod gdma;
pub mod transaction;


pub use backend::McpBackend;
pub use config::McpConfig;
pub use cp_dma::CpDma;
pub use driver::{install_cpdma, install_gdma, AsyncMemcpy};
pub use etm::McpEtmEvent;
pub use fsm::McpFsm;
pub use gdma::Gdma;
pub use transaction::{McpCallback, McpEvent, Transaction};
