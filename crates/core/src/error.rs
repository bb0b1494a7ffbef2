use demand_loading_memory::{MemoryError, PageId};
use demand_loading_scheduler::SchedulerError;

use crate::options::ConfigError;
use crate::source::SourceError;
use crate::trace::TraceError;
use crate::DeviceId;

/// Errors returned by loader and registry operations.
#[derive(Debug, thiserror::Error)]
pub enum PagingError {
    #[error("page id space exhausted: {requested} pages requested, {available} available")]
    PageSpaceExhausted { requested: u32, available: u32 },

    #[error("all {capacity} device contexts are in use")]
    ContextPoolExhausted { capacity: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("page {page_id} is outside the page table ({num_pages} pages)")]
    PageOutOfRange { page_id: PageId, num_pages: u32 },

    #[error("device failure: {0}")]
    DeviceFailure(String),

    #[error("loader for device {0} has been shut down")]
    ShutDown(DeviceId),

    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("image source error: {0}")]
    Source(#[from] SourceError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
}

/// Why a single page could not be filled.
#[derive(Debug, thiserror::Error)]
pub enum FillError {
    #[error("backing source: {0}")]
    Source(#[from] SourceError),

    #[error("out of device memory: {0}")]
    OutOfMemory(MemoryError),

    #[error("device error: {0}")]
    Device(String),

    #[error("page {0} has no handler")]
    UnknownPage(PageId),

    #[error("{0}")]
    Callback(String),
}

impl FillError {
    /// Device errors fail the whole cycle; everything else fails one page.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FillError::Device(_))
    }
}

impl From<MemoryError> for FillError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfBlocks { .. } => FillError::OutOfMemory(err),
            other => FillError::Device(other.to_string()),
        }
    }
}

impl From<SchedulerError> for FillError {
    fn from(err: SchedulerError) -> Self {
        FillError::Device(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_errors_split_by_kind() {
        let exhausted = MemoryError::OutOfBlocks {
            pool: "device",
            requested: 4,
            available: 1,
        };
        assert!(matches!(FillError::from(exhausted), FillError::OutOfMemory(_)));

        let bounds = MemoryError::OutOfBounds {
            offset: 0,
            len: 10,
            capacity: 4,
        };
        assert!(FillError::from(bounds).is_fatal());
    }

    #[test]
    fn test_stream_failure_is_fatal() {
        let err = FillError::from(SchedulerError::StreamFailed(3));
        assert!(err.is_fatal());
        assert!(!FillError::UnknownPage(7).is_fatal());
        assert!(!FillError::Callback("not ready".into()).is_fatal());
    }
}
