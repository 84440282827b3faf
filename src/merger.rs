//! Merging several rings into one timestamp-ordered ring.
//!
//! Each merge pass snapshots every registered reader and interleaves the
//! events of all snapshots by timestamp, tagging each with the index of the
//! reader it came from. Ordering holds within one pass only; an event logged
//! late by a slow source can still appear after newer events of another
//! source that were merged in an earlier pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};
use tracing::{debug, info};

use crate::abstract_entry::AbstractEntry;
use crate::entry::{EntryIterator, MAX_LENGTH, OVERHEAD};
use crate::fifo::{FifoWriter, SharedRegion};
use crate::performance::PerformanceAnalysis;
use crate::reader::{next_event, AuthorNames, DumpSink, Reader, Snapshot};

/// Capacity of the merged ring when none is given.
pub const DEFAULT_MERGE_CAPACITY: usize = 16 * 1024;

/// A reader registered with a [`Merger`] under a display name.
#[derive(Clone)]
pub struct NamedReader {
    reader: Arc<Mutex<Reader>>,
    name: String,
}

impl NamedReader {
    pub fn new(reader: Reader, name: impl Into<String>) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            name: name.into(),
        }
    }

    pub fn reader(&self) -> &Arc<Mutex<Reader>> {
        &self.reader
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for NamedReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedReader").field("name", &self.name).finish()
    }
}

/// Owns the registered source readers and the private ring they are merged
/// into.
pub struct Merger {
    region: SharedRegion,
    writer: Mutex<FifoWriter>,
    named_readers: RwLock<Vec<NamedReader>>,
}

impl Merger {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MERGE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let region = SharedRegion::new(capacity);
        Self {
            writer: Mutex::new(FifoWriter::new(region.clone())),
            region,
            named_readers: RwLock::new(Vec::new()),
        }
    }

    /// The merged ring. Attach a [`MergeReader`] (or a plain [`Reader`]) to
    /// read it.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Registers a source. Its position in the registration list becomes the
    /// author index stamped on its events.
    pub fn add_reader(&self, reader: NamedReader) {
        let mut readers = self.named_readers.write();
        debug!(name = reader.name(), author = readers.len(), "registered merge source");
        readers.push(reader);
    }

    pub fn named_readers(&self) -> Vec<NamedReader> {
        self.named_readers.read().clone()
    }

    /// Runs one merge pass.
    ///
    /// Passes are serialized; a pass started while another runs waits for it.
    pub fn merge(&self) {
        let readers = self.named_readers();
        if readers.is_empty() {
            return;
        }
        let mut writer = self.writer.lock();

        let snapshots: Vec<Snapshot> = readers.iter().map(|r| r.reader.lock().get_snapshot()).collect();
        // nothing past a snapshot's end is trusted, so cut each buffer there
        let mut cursors: Vec<EntryIterator<'_>> = snapshots
            .iter()
            .map(|s| EntryIterator::new(&s.data()[..s.end().position()], s.begin().position()))
            .collect();

        let mut queue = BinaryHeap::with_capacity(cursors.len());
        for (index, cursor) in cursors.iter_mut().enumerate() {
            let end = cursor.buffer().len();
            if let Some(entry) = next_event(cursor, end) {
                queue.push(Reverse((entry.timestamp(), index)));
            }
        }

        let mut scratch = Vec::with_capacity(4 * (MAX_LENGTH + OVERHEAD));
        let mut merged = 0usize;
        while let Some(Reverse((_, index))) = queue.pop() {
            let cursor = &mut cursors[index];
            let Some(entry) = AbstractEntry::build(*cursor) else {
                continue;
            };
            scratch.clear();
            *cursor = entry.copy_with_author(&mut scratch, index as i32);
            writer.write(&scratch);
            merged += 1;

            let end = cursor.buffer().len();
            if let Some(next) = next_event(cursor, end) {
                queue.push(Reverse((next.timestamp(), index)));
            }
        }
        let lost: usize = snapshots.iter().map(Snapshot::lost).sum();
        if merged > 0 || lost > 0 {
            debug!(merged, lost, sources = readers.len(), "merge pass done");
        }
    }
}

impl Default for Merger {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthorNames for Merger {
    fn author_name(&self, author: usize) -> Option<String> {
        self.named_readers.read().get(author).map(|r| r.name.clone())
    }
}

/// Reader over a merger's output that renders author indices as names.
pub struct MergeReader {
    reader: Reader,
    merger: Arc<Merger>,
}

impl MergeReader {
    pub fn new(merger: Arc<Merger>) -> Self {
        Self {
            reader: Reader::new(merger.region().clone()),
            merger,
        }
    }

    pub fn get_snapshot(&mut self) -> Snapshot {
        self.reader.get_snapshot()
    }

    pub fn dump(&mut self, sink: &mut dyn DumpSink, indent: usize) {
        let snapshot = self.reader.get_snapshot();
        self.reader.dump_snapshot(sink, indent, &snapshot, Some(&*self.merger));
    }

    pub fn analysis(&self) -> &PerformanceAnalysis {
        self.reader.analysis()
    }
}

/// Timing of a [`MergeThread`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeThreadConfig {
    /// Interval between merge passes while active.
    pub sleep_period: Duration,
    /// How long the thread stays active after a wakeup.
    pub wakeup_period: Duration,
}

impl Default for MergeThreadConfig {
    fn default() -> Self {
        Self {
            sleep_period: Duration::from_secs(1),
            wakeup_period: Duration::from_secs(3),
        }
    }
}

struct MergeState {
    remaining: Duration,
    exit: bool,
}

struct MergeShared {
    merger: Arc<Merger>,
    config: MergeThreadConfig,
    state: Mutex<MergeState>,
    cond: Condvar,
}

/// Background thread calling [`Merger::merge`].
///
/// Idle until [`wakeup`](Self::wakeup) is called, then merges every
/// `sleep_period` until `wakeup_period` has elapsed without another wakeup.
/// Dropping the handle stops and joins the thread.
pub struct MergeThread {
    shared: Arc<MergeShared>,
    handle: Option<JoinHandle<()>>,
}

impl MergeThread {
    /// Starts the thread, idle until the first wakeup.
    ///
    /// Fails with `InvalidInput` if `config.sleep_period` is zero.
    pub fn spawn(merger: Arc<Merger>, config: MergeThreadConfig) -> io::Result<Self> {
        if config.sleep_period.is_zero() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "merge sleep period must be non-zero"));
        }
        let shared = Arc::new(MergeShared {
            merger,
            config,
            state: Mutex::new(MergeState {
                remaining: Duration::ZERO,
                exit: false,
            }),
            cond: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("nblog-merge".into())
            .spawn(move || run(&thread_shared))?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Signals that new data is likely available.
    pub fn wakeup(&self) {
        let mut state = self.shared.state.lock();
        state.remaining = self.shared.config.wakeup_period;
        self.shared.cond.notify_one();
    }

    pub fn config(&self) -> MergeThreadConfig {
        self.shared.config
    }
}

fn run(shared: &MergeShared) {
    info!(config = ?shared.config, "merge thread started");
    let period = shared.config.sleep_period;
    let mut state = shared.state.lock();
    loop {
        if state.exit {
            break;
        }
        if state.remaining.is_zero() {
            shared.cond.wait(&mut state);
            continue;
        }
        state.remaining = state.remaining.saturating_sub(period);
        MutexGuard::unlocked(&mut state, || shared.merger.merge());
        if !state.exit && !state.remaining.is_zero() {
            shared.cond.wait_for(&mut state, period);
        }
    }
    info!("merge thread exiting");
}

impl Drop for MergeThread {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.exit = true;
            state.remaining = Duration::ZERO;
            self.shared.cond.notify_one();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{Entry, Event, HistTsEntry};

    fn push(out: &mut Vec<u8>, event: Event, data: &[u8]) {
        Entry::new(event, data).unwrap().encode_into(out);
    }

    fn source(timestamps: &[i64]) -> (SharedRegion, FifoWriter) {
        let region = SharedRegion::new(1024);
        let mut writer = FifoWriter::new(region.clone());
        for &ts in timestamps {
            let mut out = Vec::new();
            push(&mut out, Event::StartFmt, b"tick");
            push(&mut out, Event::Timestamp, &ts.to_le_bytes());
            push(&mut out, Event::Hash, &1u64.to_le_bytes());
            push(&mut out, Event::EndFmt, b"");
            writer.write(&out);
        }
        (region, writer)
    }

    #[test]
    fn test_merge_orders_by_timestamp_then_index() {
        let merger = Merger::with_capacity(4096);
        let (a, _wa) = source(&[5, 7]);
        let (b, _wb) = source(&[5, 6]);
        merger.add_reader(NamedReader::new(Reader::new(a), "a"));
        merger.add_reader(NamedReader::new(Reader::new(b), "b"));
        merger.merge();

        let mut reader = Reader::new(merger.region().clone());
        let snapshot = reader.get_snapshot();
        let order: Vec<(i64, i32)> = snapshot.entries().map(|e| (e.timestamp(), e.author())).collect();
        assert_eq!(order, vec![(5, 0), (5, 1), (6, 1), (7, 0)]);
    }

    #[test]
    fn test_merge_tags_histogram_ticks() {
        let merger = Merger::with_capacity(4096);
        let region = SharedRegion::new(256);
        let mut writer = FifoWriter::new(region.clone());
        let mut out = Vec::new();
        push(&mut out, Event::HistogramEntryTs, &HistTsEntry { hash: 9, ts: 100 }.to_bytes());
        writer.write(&out);
        merger.add_reader(NamedReader::new(Reader::new(SharedRegion::new(64)), "idle"));
        merger.add_reader(NamedReader::new(Reader::new(region), "ticks"));
        merger.merge();

        let mut reader = Reader::new(merger.region().clone());
        let snapshot = reader.get_snapshot();
        let entries: Vec<_> = snapshot.entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].author(), 1);
        assert_eq!(entries[0].hash(), 9);
        assert_eq!(entries[0].timestamp(), 100);
        assert_eq!(merger.author_name(1).as_deref(), Some("ticks"));
        assert_eq!(merger.author_name(2), None);
    }

    #[test]
    fn test_merge_without_readers_is_noop() {
        let merger = Merger::new();
        merger.merge();
        assert_eq!(merger.region().written(), 0);
    }
}
