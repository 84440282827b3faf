//! # nblog
//!
//! Non-blocking event logging through rings of shared memory.
//!
//! * **Never blocks the producer**: a log call serializes a few entries and
//!   copies them into a ring; it drops the event rather than waiting.
//! * **Survives overruns**: the ring overwrites its oldest bytes, and readers
//!   detect torn or overwritten entries through a length byte stored at both
//!   ends of every entry.
//! * **Merges many sources**: a merger interleaves any number of rings by
//!   timestamp and tags each event with the ring it came from.
//!
//! ## Main Components
//!
//! * `Writer` / `LockedWriter`: producer side, one per ring
//! * `Reader`: takes validated snapshots of a ring and renders them as text
//! * `Merger` / `MergeThread`: timestamp-ordered merge of several rings
//! * `entry`: the wire format and the cursor that walks it
//! * `fifo`: the single-writer, multi-reader byte ring and its shared region
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use nblog::{log_format, log_hash, MergeReader, Merger, NamedReader, Reader, SharedRegion, Writer};
//!
//! let audio = SharedRegion::new(4096);
//! let mut writer = Writer::new(audio.clone());
//! log_format!(writer, "underrun on track %d", log_hash!(), 3);
//!
//! let merger = Arc::new(Merger::new());
//! merger.add_reader(NamedReader::new(Reader::new(audio), "audio"));
//! merger.merge();
//!
//! let mut lines: Vec<String> = Vec::new();
//! MergeReader::new(merger).dump(&mut lines, 0);
//! assert!(lines[0].ends_with("audio: underrun on track <3>"));
//! ```

pub mod abstract_entry;
pub mod efficient_clock;
pub mod entry;
pub mod fifo;
pub mod merger;
pub mod performance;
pub mod reader;
pub mod writer;

pub use abstract_entry::{AbstractEntry, FormatEntry, HistogramEntry, NO_AUTHOR};
pub use entry::{EncodeError, Entry, EntryIterator, EntrySink, Event, LogHash};
pub use fifo::{FifoReader, FifoWriter, SharedRegion};
pub use merger::{MergeReader, MergeThread, MergeThreadConfig, Merger, NamedReader};
pub use performance::PerformanceAnalysis;
pub use reader::{AuthorNames, DumpSink, Reader, Snapshot, SystemLogSink, WriteSink};
pub use writer::{LockedWriter, LogArg, Writer};
