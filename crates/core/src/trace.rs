//! Session traces.
//!
//! With [`Options::trace_file`] set, a session writes one JSON record per
//! line: the options, every texture and resource it creates, and the page
//! ids each pull collected. Replaying such a file against fresh loaders
//! reproduces the fill workload without the application that produced it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use demand_loading_memory::PageId;
use demand_loading_scheduler::Stream;

use crate::handler::ResourceCallback;
use crate::options::Options;
use crate::page_table::PageTableEntry;
use crate::registry::DemandLoading;
use crate::source::{ImageSource, SyntheticImageSource, TextureInfo};
use crate::texture::TextureDescriptor;
use crate::{DeviceId, PagingError};

/// One line of a trace file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum TraceRecord {
    Options {
        options: Options,
    },
    Texture {
        texture_id: u32,
        first_page: PageId,
        num_pages: u32,
        descriptor: TextureDescriptor,
        info: TextureInfo,
    },
    Resource {
        first_page: PageId,
        num_pages: u32,
        backed: bool,
        /// Whether pages are filled by a callback rather than set directly
        callback: bool,
        evictable: bool,
    },
    Requests {
        device: DeviceId,
        stream: u64,
        page_ids: Vec<PageId>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("malformed record on line {line}")]
    Format {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("trace does not start with an options record")]
    MissingOptions,

    #[error("trace does not match replay: {0}")]
    Mismatch(String),
}

/// Appends records to a trace file.
#[derive(Debug)]
pub struct TraceFileWriter {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl TraceFileWriter {
    /// Create (or truncate) the trace file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&path)?;
        tracing::info!(path = %path.display(), "recording trace");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Records are flushed immediately so a crashed
    /// session still leaves a usable trace.
    pub fn record(&self, record: &TraceRecord) -> Result<(), TraceError> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Iterates over the records of a trace file.
pub struct TraceFileReader {
    lines: Lines<BufReader<File>>,
    line: usize,
}

impl TraceFileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            line: 0,
        })
    }
}

impl Iterator for TraceFileReader {
    type Item = Result<TraceRecord, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(err) => return Some(Err(err.into())),
            };
            self.line += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|source| TraceError::Format {
                line: self.line,
                source,
            }));
        }
    }
}

/// Read every record of a trace file.
pub fn read_trace_file<P: AsRef<Path>>(path: P) -> Result<Vec<TraceRecord>, TraceError> {
    TraceFileReader::open(path)?.collect()
}

/// Outcome of one replayed request batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedBatch {
    pub device: DeviceId,
    pub stream: u64,
    /// The batch as it was re-issued
    pub page_ids: Vec<PageId>,
    pub fills: usize,
    pub failures: usize,
}

/// What a replay did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReplaySummary {
    pub textures: usize,
    pub resources: usize,
    pub batches: Vec<ReplayedBatch>,
}

impl ReplaySummary {
    pub fn total_fills(&self) -> usize {
        self.batches.iter().map(|batch| batch.fills).sum()
    }

    pub fn total_failures(&self) -> usize {
        self.batches.iter().map(|batch| batch.failures).sum()
    }
}

/// Replay a trace file.
///
/// Textures are recreated with sources from `resolver`; callback resources
/// get a placeholder callback that installs `index + 1`. Each recorded
/// batch is dispatched on a stream standing in for the recorded one and
/// waited for before the next.
///
/// # Errors
///
/// Fails on malformed traces, when recreated resources do not land on the
/// recorded page ids, and on device failures.
pub fn replay_trace_file<P, F>(path: P, resolver: F) -> Result<ReplaySummary, PagingError>
where
    P: AsRef<Path>,
    F: Fn(&TextureInfo) -> Arc<dyn ImageSource>,
{
    let mut records = TraceFileReader::open(path)?;
    let mut options = match records.next() {
        Some(Ok(TraceRecord::Options { options })) => options,
        Some(Err(err)) => return Err(err.into()),
        _ => return Err(TraceError::MissingOptions.into()),
    };
    options.trace_file = None;

    let session = DemandLoading::new(options)?;
    let mut streams: BTreeMap<(DeviceId, u64), Arc<Stream>> = BTreeMap::new();
    let mut summary = ReplaySummary::default();

    for record in records {
        match record? {
            TraceRecord::Options { .. } => {
                return Err(TraceError::Mismatch("second options record".into()).into());
            }
            TraceRecord::Texture {
                texture_id,
                first_page,
                descriptor,
                info,
                ..
            } => {
                let texture = session.create_texture(resolver(&info), descriptor)?;
                expect_first_page(first_page, texture.page_range().start)?;
                tracing::debug!(recorded = texture_id, replayed = texture.id(), "texture recreated");
                summary.textures += 1;
            }
            TraceRecord::Resource {
                first_page,
                num_pages,
                backed,
                callback,
                evictable,
            } => {
                let range = if callback {
                    let fill: ResourceCallback = Arc::new(|_, index| Ok(PageTableEntry(index as u64 + 1)));
                    session.create_resource(num_pages, evictable, fill)?
                } else {
                    session.allocate_pages(num_pages, backed)?
                };
                expect_first_page(first_page, range.start)?;
                summary.resources += 1;
            }
            TraceRecord::Requests {
                device,
                stream,
                page_ids,
            } => {
                let loader = session.loader(device)?;
                let replay_stream = match streams.get(&(device, stream)) {
                    Some(replay_stream) => replay_stream.clone(),
                    None => {
                        let replay_stream = Arc::new(Stream::new(&format!("replay-d{device}"))?);
                        streams.insert((device, stream), replay_stream.clone());
                        replay_stream
                    }
                };
                let ticket_id = summary.batches.len() as u32;
                let ticket = loader.replay_requests(&replay_stream, ticket_id, &page_ids)?;
                ticket.wait()?;
                summary.batches.push(ReplayedBatch {
                    device,
                    stream,
                    page_ids,
                    fills: ticket.num_tasks_total(),
                    failures: ticket.failures().len(),
                });
            }
        }
    }

    session.shutdown();
    tracing::info!(
        textures = summary.textures,
        resources = summary.resources,
        batches = summary.batches.len(),
        fills = summary.total_fills(),
        "trace replayed"
    );
    Ok(summary)
}

/// Replay a trace with synthetic image data for every texture.
pub fn replay_trace_file_synthetic<P: AsRef<Path>>(path: P) -> Result<ReplaySummary, PagingError> {
    replay_trace_file(path, |info| Arc::new(SyntheticImageSource::new(*info)))
}

fn expect_first_page(recorded: PageId, replayed: PageId) -> Result<(), TraceError> {
    if recorded != replayed {
        return Err(TraceError::Mismatch(format!(
            "resource recorded at page {recorded} replayed at page {replayed}"
        )));
    }
    Ok(())
}
