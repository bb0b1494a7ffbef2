//! Demand Loading Memory Library
//!
//! Device-side storage for the paging engine: a block arena standing in for
//! device tile memory and pinned staging buffers, the pool of reusable device
//! contexts handed to launches, and the byte budget that drives eviction.

pub mod budget;
pub mod context;
mod error;
pub mod pool;

pub use budget::{MemoryBudget, MemoryBudgetConfig, MemoryPressure};
pub use context::{ContextHandle, DeviceContext, DeviceContextPool, RequestSnapshot};
pub use error::MemoryError;
pub use pool::{MemoryBlock, MemoryPool, PoolStats};

/// Identifier of one page of demand-loaded data.
pub type PageId = u32;

/// Address in (simulated) device memory.
pub type DeviceAddress = u64;
