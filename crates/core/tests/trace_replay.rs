use std::sync::Arc;

use demand_loading_core::{
    read_trace_file, replay_trace_file, replay_trace_file_synthetic, DemandLoading, ImageSource,
    Options, PixelFormat, Stream, SyntheticImageSource, TextureDescriptor, TextureInfo, TraceRecord,
};
use tempfile::tempdir;

fn options() -> Options {
    Options::default()
        .with_num_pages(2048)
        .with_max_threads(2)
        .with_max_active_streams(1)
        .with_device_memory_capacity(1 << 20)
        .with_staging_memory_capacity(1 << 18)
        .with_block_size(4096)
}

#[test]
fn recorded_session_replays_identical_batches() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session").join("trace.jsonl");

    let session = DemandLoading::new(options().with_trace_file(&path)).unwrap();
    let info = TextureInfo::new(128, 128, PixelFormat::Rgba8);
    let texture = session
        .create_texture(Arc::new(SyntheticImageSource::new(info)), TextureDescriptor::default())
        .unwrap();
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("record").unwrap());
    let context = loader.acquire_context().unwrap();

    loader.push_mappings(&stream, &context).unwrap();
    let launch = context.clone();
    let sampler = texture.sampler_page();
    stream
        .enqueue(move || {
            launch.lock().map_or_request(sampler);
        })
        .unwrap();
    loader.pull_requests(&stream, &context, 0).unwrap().wait().unwrap();
    session.shutdown();

    let records = read_trace_file(&path).unwrap();
    assert_eq!(records.len(), 3);
    assert!(matches!(&records[0], TraceRecord::Options { options } if options.num_pages == 2048));
    assert!(matches!(
        &records[1],
        TraceRecord::Texture { first_page: 0, info: recorded, .. } if *recorded == info
    ));
    assert!(matches!(
        &records[2],
        TraceRecord::Requests { device: 0, page_ids, .. } if page_ids == &vec![sampler]
    ));

    let summary = replay_trace_file_synthetic(&path).unwrap();
    assert_eq!(summary.textures, 1);
    assert_eq!(summary.batches.len(), 1);
    assert_eq!(summary.batches[0].page_ids, vec![sampler]);
    assert_eq!(summary.batches[0].fills, 1);
    assert_eq!(summary.total_failures(), 0);
}

#[test]
fn replay_uses_resolved_sources() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trace.jsonl");

    let session = DemandLoading::new(options().with_trace_file(&path)).unwrap();
    let info = TextureInfo::new(256, 256, PixelFormat::R8);
    let texture = session
        .create_texture(Arc::new(SyntheticImageSource::new(info)), TextureDescriptor::default())
        .unwrap();
    let tiles: Vec<_> = (0..4)
        .map(|x| texture.tile_page_id(0, x, 0).unwrap())
        .collect();
    let loader = session.loader(0).unwrap();
    let stream = Arc::new(Stream::new("record").unwrap());
    loader.replay_requests(&stream, 0, &tiles).unwrap().wait().unwrap();
    session.shutdown();

    let source = Arc::new(SyntheticImageSource::new(info));
    let resolved = source.clone();
    let summary = replay_trace_file(&path, move |recorded| {
        assert_eq!(*recorded, info);
        resolved.clone() as Arc<dyn ImageSource>
    })
    .unwrap();

    assert_eq!(summary.total_fills(), 4);
    assert_eq!(source.tile_reads(), 4);
}
