//! Per-device loaders of one demand loading session.
//!
//! Resources are registered once for the whole session; their page ids are
//! global. Every device gets its own [`DemandPageLoader`], built the first
//! time the device is used, with a handler for each registration.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::handler::{ResourceCallback, ResourceRequestHandler, SamplerRequestHandler, TextureRequestHandler};
use crate::loader::DemandPageLoader;
use crate::options::Options;
use crate::page_table::{PageIdRange, PageTableManager};
use crate::source::ImageSource;
use crate::texture::{DemandTexture, TextureDescriptor, TextureLayout};
use crate::trace::{TraceFileWriter, TraceRecord};
use crate::{DeviceId, PagingError};

enum Registration {
    Texture(Arc<DemandTexture>),
    Resource {
        range: PageIdRange,
        callback: ResourceCallback,
        evictable: bool,
    },
}

impl Registration {
    fn install(&self, loader: &DemandPageLoader) {
        match self {
            Registration::Texture(texture) => {
                let range = texture.page_range();
                let sampler = PageIdRange::new(range.start, range.start + 1);
                let data = PageIdRange::new(range.start + 1, range.end);
                loader.register_handler(
                    sampler,
                    Arc::new(SamplerRequestHandler::new(texture.clone(), loader.memory().clone())),
                );
                loader.register_handler(
                    data,
                    Arc::new(TextureRequestHandler::new(texture.clone(), loader.memory().clone())),
                );
            }
            Registration::Resource {
                range,
                callback,
                evictable,
            } => loader.register_handler(
                *range,
                Arc::new(ResourceRequestHandler::new(*range, callback.clone(), *evictable)),
            ),
        }
    }
}

/// A demand loading session spanning any number of devices.
///
/// # Example
///
/// ```
/// use demand_loading_core::{DemandLoading, Options, PageTableEntry, ResourceCallback};
/// use std::sync::Arc;
///
/// let options = Options::default().with_num_pages(1024).with_max_threads(1);
/// let session = DemandLoading::new(options).unwrap();
/// let callback: ResourceCallback = Arc::new(|_, index| Ok(PageTableEntry(index as u64 + 1)));
/// let range = session.create_resource(16, true, callback).unwrap();
/// assert_eq!(range.len(), 16);
///
/// let loader = session.loader(0).unwrap();
/// assert_eq!(loader.device(), 0);
/// session.shutdown();
/// ```
pub struct DemandLoading {
    options: Options,
    page_table: Arc<PageTableManager>,
    /// Locked before `loaders` when both are needed
    registrations: Mutex<Vec<Registration>>,
    loaders: Mutex<BTreeMap<DeviceId, Arc<DemandPageLoader>>>,
    trace: Option<Arc<TraceFileWriter>>,
}

impl DemandLoading {
    /// Start a session. Opens the trace file if the options name one.
    pub fn new(options: Options) -> Result<Self, PagingError> {
        options.validate()?;
        let trace = match &options.trace_file {
            Some(path) => {
                let writer = Arc::new(TraceFileWriter::create(path)?);
                writer.record(&TraceRecord::Options {
                    options: options.clone(),
                })?;
                Some(writer)
            }
            None => None,
        };

        tracing::info!(
            num_pages = options.num_pages,
            max_texture_memory_mb = options.max_texture_memory_mb(),
            eviction = options.eviction_active,
            "demand loading session started"
        );
        Ok(Self {
            page_table: Arc::new(PageTableManager::new(options.num_pages)),
            options,
            registrations: Mutex::new(Vec::new()),
            loaders: Mutex::new(BTreeMap::new()),
            trace,
        })
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn page_table(&self) -> &Arc<PageTableManager> {
        &self.page_table
    }

    /// The loader of `device`, built on first use.
    pub fn loader(&self, device: DeviceId) -> Result<Arc<DemandPageLoader>, PagingError> {
        let registrations = self.registrations.lock();
        let mut loaders = self.loaders.lock();
        if let Some(loader) = loaders.get(&device) {
            return Ok(loader.clone());
        }

        let loader = Arc::new(DemandPageLoader::new(
            device,
            self.options.clone(),
            self.page_table.clone(),
            self.trace.clone(),
        )?);
        for registration in registrations.iter() {
            registration.install(&loader);
        }
        tracing::debug!(device, registrations = registrations.len(), "loader built");
        loaders.insert(device, loader.clone());
        Ok(loader)
    }

    /// Devices with a live loader
    pub fn devices(&self) -> Vec<DeviceId> {
        self.loaders.lock().keys().copied().collect()
    }

    /// Register a texture read from `source`.
    ///
    /// The source is opened right away; its info sizes the page range.
    pub fn create_texture(
        &self,
        source: Arc<dyn ImageSource>,
        descriptor: TextureDescriptor,
    ) -> Result<Arc<DemandTexture>, PagingError> {
        let info = source.open()?;
        let layout = TextureLayout::new(info, descriptor)?;
        let num_pages = layout.num_pages();
        let reservation = self.page_table.reserve(num_pages, true)?;
        let texture = Arc::new(DemandTexture::new(
            reservation.resource,
            reservation.range,
            layout,
            source,
        ));

        self.record(TraceRecord::Texture {
            texture_id: texture.id(),
            first_page: reservation.range.start,
            num_pages,
            descriptor,
            info,
        });
        tracing::debug!(
            texture = texture.id(),
            first_page = reservation.range.start,
            num_pages,
            width = info.width,
            height = info.height,
            "texture registered"
        );
        self.register(Registration::Texture(texture.clone()));
        Ok(texture)
    }

    /// Register `num_pages` pages filled by `callback`.
    pub fn create_resource(
        &self,
        num_pages: u32,
        evictable: bool,
        callback: ResourceCallback,
    ) -> Result<PageIdRange, PagingError> {
        let reservation = self.page_table.reserve(num_pages, true)?;
        self.record(TraceRecord::Resource {
            first_page: reservation.range.start,
            num_pages,
            backed: true,
            callback: true,
            evictable,
        });
        self.register(Registration::Resource {
            range: reservation.range,
            callback,
            evictable,
        });
        Ok(reservation.range)
    }

    /// Reserve pages whose entries the client installs itself on each
    /// loader with [`DemandPageLoader::set_page_table_entry`].
    pub fn allocate_pages(&self, num_pages: u32, backed: bool) -> Result<PageIdRange, PagingError> {
        let reservation = self.page_table.reserve(num_pages, backed)?;
        self.record(TraceRecord::Resource {
            first_page: reservation.range.start,
            num_pages,
            backed,
            callback: false,
            evictable: false,
        });
        Ok(reservation.range)
    }

    /// Every texture registered so far
    pub fn textures(&self) -> Vec<Arc<DemandTexture>> {
        self.registrations
            .lock()
            .iter()
            .filter_map(|registration| match registration {
                Registration::Texture(texture) => Some(texture.clone()),
                Registration::Resource { .. } => None,
            })
            .collect()
    }

    /// Shut down and forget the loader of `device`. Returns false if the
    /// device had none.
    pub fn remove_device(&self, device: DeviceId) -> bool {
        let loader = self.loaders.lock().remove(&device);
        match loader {
            Some(loader) => {
                loader.shutdown();
                true
            }
            None => false,
        }
    }

    /// Shut down every loader.
    pub fn shutdown(&self) {
        let loaders = std::mem::take(&mut *self.loaders.lock());
        for loader in loaders.values() {
            loader.shutdown();
        }
        tracing::info!(devices = loaders.len(), "demand loading session shut down");
    }

    fn register(&self, registration: Registration) {
        let mut registrations = self.registrations.lock();
        for loader in self.loaders.lock().values() {
            registration.install(loader);
        }
        registrations.push(registration);
    }

    fn record(&self, record: TraceRecord) {
        if let Some(trace) = &self.trace {
            if let Err(err) = trace.record(&record) {
                tracing::warn!(%err, path = %trace.path().display(), "failed to write trace record");
            }
        }
    }
}

impl std::fmt::Debug for DemandLoading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DemandLoading")
            .field("num_pages", &self.options.num_pages)
            .field("registrations", &self.registrations.lock().len())
            .field("devices", &self.devices())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page_table::PageTableEntry;
    use crate::paging::PageState;
    use crate::source::{PixelFormat, SyntheticImageSource, TextureInfo};
    use demand_loading_scheduler::Stream;

    fn options() -> Options {
        Options::default()
            .with_num_pages(4096)
            .with_max_threads(2)
            .with_max_active_streams(1)
            .with_device_memory_capacity(4 << 20)
            .with_staging_memory_capacity(1 << 20)
            .with_block_size(4096)
    }

    fn callback() -> ResourceCallback {
        Arc::new(|_, index| Ok(PageTableEntry(index as u64 + 1)))
    }

    #[test]
    fn test_loaders_built_lazily_with_existing_registrations() {
        let session = DemandLoading::new(options()).unwrap();
        let range = session.create_resource(8, true, callback()).unwrap();
        assert!(session.devices().is_empty());

        let loader = session.loader(3).unwrap();
        assert!(Arc::ptr_eq(&loader, &session.loader(3).unwrap()));
        assert_eq!(session.devices(), vec![3]);

        let stream = Arc::new(Stream::new("test").unwrap());
        loader.replay_requests(&stream, 0, &[range.start + 2]).unwrap().wait().unwrap();
        assert_eq!(loader.entry(range.start + 2), Some(PageTableEntry(3)));
    }

    #[test]
    fn test_registration_reaches_live_loaders() {
        let session = DemandLoading::new(options()).unwrap();
        let loader = session.loader(0).unwrap();
        let range = session.create_resource(4, false, callback()).unwrap();

        let stream = Arc::new(Stream::new("test").unwrap());
        let ticket = loader.replay_requests(&stream, 0, &[range.start]).unwrap();
        ticket.wait().unwrap();
        assert!(ticket.failures().is_empty());
        assert_eq!(loader.page_state(range.start), PageState::Resident);
    }

    #[test]
    fn test_textures_get_consecutive_ranges() {
        let session = DemandLoading::new(options()).unwrap();
        let info = TextureInfo::new(256, 256, PixelFormat::Rgba8);
        let a = session
            .create_texture(Arc::new(SyntheticImageSource::new(info)), TextureDescriptor::default())
            .unwrap();
        let b = session
            .create_texture(Arc::new(SyntheticImageSource::new(info)), TextureDescriptor::default())
            .unwrap();

        assert_eq!(a.page_range().end, b.page_range().start);
        assert_ne!(a.id(), b.id());
        assert_eq!(session.textures().len(), 2);
    }

    #[test]
    fn test_page_space_exhaustion() {
        let session = DemandLoading::new(options().with_num_pages(16)).unwrap();
        session.create_resource(10, true, callback()).unwrap();
        assert!(matches!(
            session.create_resource(10, true, callback()),
            Err(PagingError::PageSpaceExhausted { requested: 10, available: 6 })
        ));
    }

    #[test]
    fn test_remove_device() {
        let session = DemandLoading::new(options()).unwrap();
        let loader = session.loader(1).unwrap();
        assert!(session.remove_device(1));
        assert!(!session.remove_device(1));
        assert!(loader.is_shut_down());
        assert!(session.devices().is_empty());
    }
}
