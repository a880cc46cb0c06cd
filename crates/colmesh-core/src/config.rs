//! Execution core configuration.

use serde::{Deserialize, Serialize};

/// Column cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for cached column shards.
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512MB
        }
    }
}

impl CacheConfig {
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

/// Plan execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Row ids per batch pushed between steps.
    pub batch_size: usize,
    /// Rows per page of derived temporary columns.
    pub page_size: usize,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            page_size: crate::storage::DEFAULT_PAGE_SIZE,
        }
    }
}

impl PlanConfig {
    /// Set the batch size. Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the page size of derived columns.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}
