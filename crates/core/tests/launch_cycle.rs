use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use demand_loading_core::{
    ContextHandle, DemandLoading, DemandPageLoader, DemandTexture, FillError, Options, PageId,
    PageState, PageTableEntry, PixelFormat, Reload, ResourceCallback, Stream, SyntheticImageSource,
    TextureDescriptor, TextureInfo, TextureSampler,
};
use parking_lot::Mutex;

const TILE_BYTES: usize = 64 * 64;

fn options() -> Options {
    Options::default()
        .with_num_pages(4096)
        .with_max_threads(4)
        .with_max_active_streams(2)
        .with_device_memory_capacity(1 << 20)
        .with_staging_memory_capacity(1 << 18)
        .with_block_size(4096)
}

/// Run a launch on `stream` that looks up `pages` in `context`.
fn launch(stream: &Stream, context: &ContextHandle, pages: &[PageId]) -> Vec<Option<u64>> {
    let context = context.clone();
    let pages = pages.to_vec();
    stream
        .enqueue_with_result(move || {
            let mut context = context.lock();
            pages.iter().map(|&page| context.map_or_request(page)).collect()
        })
        .unwrap()
        .wait()
        .unwrap()
}

/// One full cycle: push, launch, pull, wait.
fn cycle(loader: &DemandPageLoader, stream: &Arc<Stream>, context: &ContextHandle, pages: &[PageId]) -> usize {
    loader.push_mappings(stream, context).unwrap();
    launch(stream, context, pages);
    let ticket = loader.pull_requests(stream, context, 0).unwrap();
    ticket.wait().unwrap();
    assert!(ticket.failures().is_empty(), "fills failed: {:?}", ticket.failures());
    ticket.num_tasks_total()
}

fn texture(session: &DemandLoading, size: u32) -> Arc<DemandTexture> {
    let info = TextureInfo::new(size, size, PixelFormat::R8);
    session
        .create_texture(
            Arc::new(SyntheticImageSource::new(info)),
            TextureDescriptor::default().with_tile_size(64, 64),
        )
        .unwrap()
}

#[test]
fn end_to_end_resource_fill() {
    let session = DemandLoading::new(options()).unwrap();
    let callback: ResourceCallback = Arc::new(|_, index| Ok(PageTableEntry(0x5000 + index as u64)));
    let range = session.create_resource(64, true, callback).unwrap();
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("e2e").unwrap());
    let context = loader.acquire_context().unwrap();

    let first = range.start;
    assert_eq!(cycle(&loader, &stream, &context, &[first + 3, first + 3, first + 40]), 2);

    loader.push_mappings(&stream, &context).unwrap();
    let seen = launch(&stream, &context, &[first + 3, first + 40, first + 41]);
    assert_eq!(seen, vec![Some(0x5003), Some(0x5028), None]);
    assert_eq!(loader.page_state(first + 41), PageState::NonResident);

    loader.release_context(&context);
    session.shutdown();
}

#[test]
fn in_flight_pages_are_not_dispatched_twice() {
    let session = DemandLoading::new(options()).unwrap();
    let (release, gate) = mpsc::channel::<()>();
    let gate = Arc::new(Mutex::new(gate));
    let callback: ResourceCallback = Arc::new(move |_, index| {
        gate.lock()
            .recv_timeout(Duration::from_secs(10))
            .map_err(|err| FillError::Callback(err.to_string()))?;
        Ok(PageTableEntry(index as u64 + 1))
    });
    let range = session.create_resource(16, true, callback).unwrap();
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("slow").unwrap());
    let context = loader.acquire_context().unwrap();
    let page = range.start + 5;

    loader.push_mappings(&stream, &context).unwrap();
    launch(&stream, &context, &[page]);
    let first = loader.pull_requests(&stream, &context, 1).unwrap();
    assert_eq!(first.num_tasks_total(), 1);

    // The page stays in flight while the second launch asks for it again
    loader.push_mappings(&stream, &context).unwrap();
    assert_eq!(launch(&stream, &context, &[page]), vec![None]);
    let second = loader.pull_requests(&stream, &context, 2).unwrap();
    assert_eq!(second.num_tasks_total(), 0);
    assert!(second.is_done());
    assert!(matches!(
        loader.page_state(page),
        PageState::Requested | PageState::Filling
    ));

    // Eviction pressure cannot touch it either
    loader.set_max_texture_memory(1);
    assert_ne!(loader.page_state(page), PageState::NonResident);

    release.send(()).unwrap();
    first.wait().unwrap();
    assert_eq!(loader.entry(page), Some(PageTableEntry(6)));
    assert_eq!(loader.stats().fills_dispatched, 1);
    session.shutdown();
}

#[test]
fn texture_tiles_round_trip_through_device_memory() {
    let session = DemandLoading::new(options()).unwrap();
    let texture = texture(&session, 256);
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("tiles").unwrap());
    let context = loader.acquire_context().unwrap();

    let tile = texture.tile_page_id(0, 1, 1).unwrap();
    let pages = [texture.sampler_page(), texture.mip_tail_page(), tile];
    assert_eq!(cycle(&loader, &stream, &context, &pages), 3);

    let address = loader.entry(tile).unwrap().value();
    let data = loader.memory().read(address, TILE_BYTES).unwrap();
    assert_eq!(data[0], SyntheticImageSource::texel(0, 64, 64));
    assert_eq!(data[64 * 3 + 7], SyntheticImageSource::texel(0, 71, 67));

    let sampler_address = loader.entry(texture.sampler_page()).unwrap().value();
    let record = loader
        .memory()
        .read(sampler_address, TextureSampler::SIZE)
        .unwrap();
    assert_eq!(
        TextureSampler::from_bytes(&record),
        Some(texture.sampler())
    );
    session.shutdown();
}

#[test]
fn eviction_respects_budget_and_pins() {
    let session = DemandLoading::new(options().with_max_texture_memory(4 * TILE_BYTES)).unwrap();
    let texture = texture(&session, 256);
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("evict").unwrap());
    let context = loader.acquire_context().unwrap();

    let tiles: Vec<PageId> = (0..8)
        .map(|i| texture.tile_page_id(0, i % 4, i / 4).unwrap())
        .collect();
    assert_eq!(cycle(&loader, &stream, &context, &tiles), 8);

    // Everything the last launch asked for is pinned
    loader.push_mappings(&stream, &context).unwrap();
    assert_eq!(loader.stats().resident_pages, 8);

    // An empty launch releases the pins; the next push evicts to target and
    // frees the storage once its mappings are installed
    launch(&stream, &context, &[]);
    loader.pull_requests(&stream, &context, 0).unwrap().wait().unwrap();
    loader.push_mappings(&stream, &context).unwrap();
    stream.synchronize().unwrap();

    let stats = loader.stats();
    assert_eq!(stats.evictions, 5);
    assert_eq!(stats.resident_pages, 3);
    assert_eq!(stats.resident_bytes, 3 * TILE_BYTES);
    assert_eq!(stats.device_bytes_in_use, 3 * TILE_BYTES);
    assert_eq!(stats.retired_pages, 0);

    // Least recently used first, lowest page id breaking ties
    assert_eq!(loader.page_state(tiles[0]), PageState::NonResident);
    assert_eq!(loader.page_state(tiles[7]), PageState::Resident);

    // Evicted tiles come back with the same data
    assert_eq!(cycle(&loader, &stream, &context, &[tiles[0]]), 1);
    let address = loader.entry(tiles[0]).unwrap().value();
    let data = loader.memory().read(address, TILE_BYTES).unwrap();
    assert_eq!(data[1], SyntheticImageSource::texel(0, 1, 0));
    session.shutdown();
}

#[test]
fn evicted_storage_is_not_reused_while_a_launch_maps_it() {
    let session = DemandLoading::new(options()).unwrap();
    let texture = texture(&session, 256);
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("launch").unwrap());
    let uploads = Arc::new(Stream::new("uploads").unwrap());
    let context = loader.acquire_context().unwrap();

    let p = texture.tile_page_id(0, 0, 0).unwrap();
    let q = texture.tile_page_id(0, 2, 0).unwrap();
    let r = texture.tile_page_id(0, 1, 0).unwrap();
    assert_ne!(SyntheticImageSource::texel(0, 0, 0), SyntheticImageSource::texel(0, 64, 0));

    cycle(&loader, &stream, &context, &[p]);
    cycle(&loader, &stream, &context, &[q]);

    // A launch mapping p is running while the host evicts p and fills r
    loader.push_mappings(&stream, &context).unwrap();
    let (start, gate) = mpsc::channel::<()>();
    let memory = loader.memory().clone();
    let running = context.clone();
    let event = stream
        .enqueue_with_result(move || {
            gate.recv_timeout(Duration::from_secs(10)).unwrap();
            let entry = running.lock().map_or_request(p).unwrap();
            memory.read(entry, 1).unwrap()[0]
        })
        .unwrap();

    loader.set_max_texture_memory(1);
    assert_eq!(loader.page_state(p), PageState::NonResident);
    assert_eq!(loader.stats().retired_pages, 1);
    loader.set_max_texture_memory(0);
    let ticket = loader.replay_requests(&uploads, 0, &[r]).unwrap();
    ticket.wait().unwrap();
    assert!(ticket.failures().is_empty());

    start.send(()).unwrap();
    assert_eq!(event.wait().unwrap(), SyntheticImageSource::texel(0, 0, 0));

    // The next push installs mappings without p and frees its block
    loader.push_mappings(&stream, &context).unwrap();
    stream.synchronize().unwrap();
    let stats = loader.stats();
    assert_eq!(stats.retired_pages, 0);
    assert_eq!(stats.device_bytes_in_use, stats.resident_bytes);
    session.shutdown();
}

#[test]
fn invalidation_with_reload_refills_page() {
    let session = DemandLoading::new(options()).unwrap();
    let generation = Arc::new(Mutex::new(1u64));
    let current = generation.clone();
    let callback: ResourceCallback =
        Arc::new(move |_, index| Ok(PageTableEntry(*current.lock() * 100 + index as u64)));
    let range = session.create_resource(8, true, callback).unwrap();
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("reload").unwrap());
    let context = loader.acquire_context().unwrap();

    cycle(&loader, &stream, &context, &[range.start + 1, range.start + 2]);
    assert_eq!(loader.entry(range.start + 1), Some(PageTableEntry(101)));

    *generation.lock() = 2;
    loader
        .invalidate_page_range(
            range.start,
            range.end,
            Arc::new(Reload(|_: PageId, entry: PageTableEntry| entry == PageTableEntry(101))),
        )
        .unwrap();

    // The push applies the invalidation; the next pull dispatches the reload
    assert_eq!(cycle(&loader, &stream, &context, &[]), 1);
    assert_eq!(loader.entry(range.start + 1), Some(PageTableEntry(201)));
    assert_eq!(loader.entry(range.start + 2), Some(PageTableEntry(102)));
    assert_eq!(loader.stats().invalidations, 1);
    session.shutdown();
}

#[test]
fn devices_have_independent_residency() {
    let session = DemandLoading::new(options()).unwrap();
    let texture = texture(&session, 128);
    let first = session.loader(0).unwrap();
    let second = session.loader(1).unwrap();
    let stream = Arc::new(Stream::new("multi").unwrap());

    let tile = texture.tile_page_id(0, 0, 0).unwrap();
    let context = first.acquire_context().unwrap();
    cycle(&first, &stream, &context, &[tile]);
    assert_eq!(first.page_state(tile), PageState::Resident);
    assert_eq!(second.page_state(tile), PageState::NonResident);

    let context = second.acquire_context().unwrap();
    cycle(&second, &stream, &context, &[tile]);
    let a = first.entry(tile).unwrap();
    let b = second.entry(tile).unwrap();
    assert_ne!(a, b, "devices must not share device addresses");
    assert_eq!(session.devices(), vec![0, 1]);
    session.shutdown();
}

#[test]
fn device_failure_is_confined_to_its_loader() {
    let session = DemandLoading::new(options()).unwrap();
    let callback: ResourceCallback = Arc::new(|_, index| {
        if index == 0 {
            return Err(FillError::Device("lost device".into()));
        }
        Ok(PageTableEntry(index as u64 + 1))
    });
    let range = session.create_resource(4, true, callback).unwrap();
    let broken = session.loader(0).unwrap();
    let healthy = session.loader(1).unwrap();
    let stream = Arc::new(Stream::new("failure").unwrap());

    let ticket = broken.replay_requests(&stream, 3, &[range.start]).unwrap();
    assert!(ticket.wait().is_err());
    assert!(broken.device_error().is_some());
    let context = broken.acquire_context().unwrap();
    assert!(broken.push_mappings(&stream, &context).is_err());

    let ticket = healthy.replay_requests(&stream, 4, &[range.start + 1]).unwrap();
    ticket.wait().unwrap();
    assert_eq!(healthy.entry(range.start + 1), Some(PageTableEntry(2)));
    assert!(healthy.device_error().is_none());
    session.shutdown();
}
