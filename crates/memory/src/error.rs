use crate::DeviceAddress;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory pool '{pool}' out of blocks: requested {requested}, {available} free")]
    OutOfBlocks { pool: &'static str, requested: usize, available: usize },
    #[error("allocation size must be non-zero")]
    InvalidSize,
    #[error("block at {address:#x} does not belong to pool '{pool}' or is not allocated")]
    InvalidBlock { pool: &'static str, address: DeviceAddress },
    #[error("access of {len} bytes at offset {offset} exceeds block of {capacity} bytes")]
    OutOfBounds { offset: usize, len: usize, capacity: usize },
    #[error("device context pool exhausted ({capacity} contexts in use)")]
    ContextPoolExhausted { capacity: usize },
}
