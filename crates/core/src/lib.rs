//! Demand Loading Core Library
//!
//! Paging engine that keeps a device's view of large resources partially
//! resident. Launches look pages up through a device context; pages they
//! find missing are collected after the launch, filled in the background by
//! per-resource handlers, and published to the next launch.
//!
//! # Example
//!
//! ```
//! use demand_loading_core::{DemandLoading, Options, PageTableEntry, ResourceCallback, Stream};
//! use std::sync::Arc;
//!
//! let options = Options::default().with_num_pages(1024).with_max_threads(2);
//! let session = DemandLoading::new(options).unwrap();
//! let callback: ResourceCallback = Arc::new(|_, index| Ok(PageTableEntry(0x1000 + index as u64)));
//! let range = session.create_resource(64, true, callback).unwrap();
//!
//! let loader = session.loader(0).unwrap();
//! let stream = Arc::new(Stream::new("device0").unwrap());
//! let context = loader.acquire_context().unwrap();
//!
//! // One launch: publish mappings, let the device touch a page, collect misses
//! loader.push_mappings(&stream, &context).unwrap();
//! let launch = context.clone();
//! stream
//!     .enqueue(move || {
//!         launch.lock().map_or_request(range.start + 5);
//!     })
//!     .unwrap();
//! let ticket = loader.pull_requests(&stream, &context, 0).unwrap();
//! ticket.wait().unwrap();
//!
//! assert_eq!(loader.entry(range.start + 5), Some(PageTableEntry(0x1005)));
//! loader.release_context(&context);
//! session.shutdown();
//! ```

mod error;
pub mod handler;
pub mod loader;
pub mod options;
pub mod page_table;
pub mod paging;
pub mod registry;
mod retire;
pub mod source;
pub mod texture;
pub mod trace;

/// Identifier of one device of a session.
pub type DeviceId = u32;

pub use error::{FillError, PagingError};
pub use handler::{
    DeviceMemory, FilledPage, RequestHandler, ResourceCallback, ResourceRequestHandler,
    SamplerRequestHandler, TextureRequestHandler,
};
pub use loader::{DemandPageLoader, LoaderStats};
pub use options::{ConfigError, Options};
pub use page_table::{PageIdRange, PageTableEntry, PageTableManager, Reservation, ResourceId};
pub use paging::{
    EvictedPage, InvalidationRange, PageInvalidator, PageState, PagingStats, PagingSystem, Reload,
};
pub use registry::DemandLoading;
pub use source::{ImageSource, PixelFormat, SourceError, SyntheticImageSource, TextureInfo};
pub use texture::{DemandTexture, TextureDescriptor, TextureLayout, TexturePage, TextureSampler};
pub use trace::{
    read_trace_file, replay_trace_file, replay_trace_file_synthetic, ReplaySummary,
    ReplayedBatch, TraceError, TraceFileReader, TraceFileWriter, TraceRecord,
};

pub use demand_loading_memory::{ContextHandle, DeviceContext, PageId};
pub use demand_loading_scheduler::{JobPriority, SchedulerError, Stream, TaskStatus, Ticket};
