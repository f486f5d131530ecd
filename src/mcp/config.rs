//! 驱动安装配置

use crate::config::{DEFAULT_BACKLOG, MAX_CHANNEL_WEIGHT};
use crate::error::{McpError, McpResult};

/// 异步 memcpy 安装配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McpConfig {
    /// 事务积压深度 (0 表示使用默认值)
    pub backlog: usize,
    /// DMA 突发长度 (字节，0 表示关闭突发，否则必须为 2 的幂)
    pub dma_burst_size: usize,
    /// 通道仲裁权重 (1..=15)
    pub weight: Option<u32>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl McpConfig {
    /// 创建默认配置
    pub const fn new() -> Self {
        Self {
            backlog: DEFAULT_BACKLOG,
            dma_burst_size: 0,
            weight: None,
        }
    }

    /// 设置积压深度
    pub fn with_backlog(mut self, backlog: usize) -> Self {
        self.backlog = backlog;
        self
    }

    /// 设置突发长度
    pub fn with_dma_burst_size(mut self, size: usize) -> Self {
        self.dma_burst_size = size;
        self
    }

    /// 设置通道仲裁权重
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// 实际使用的积压深度
    pub fn effective_backlog(&self) -> usize {
        if self.backlog == 0 {
            DEFAULT_BACKLOG
        } else {
            self.backlog
        }
    }

    /// 检查配置
    pub fn validate(&self) -> McpResult<()> {
        if self.dma_burst_size != 0 && !self.dma_burst_size.is_power_of_two() {
            return Err(McpError::InvalidArgument);
        }
        if let Some(weight) = self.weight {
            if weight == 0 || weight > MAX_CHANNEL_WEIGHT {
                return Err(McpError::InvalidArgument);
            }
        }
        Ok(())
    }
}
