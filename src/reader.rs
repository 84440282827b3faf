//! Consumer side: takes validated snapshots of a ring and renders them.
//!
//! A snapshot is a private copy of everything currently readable. Its tail may
//! hold a composite the writer has not finished, and its head may start in the
//! middle of an overwritten one, so only the range between the first starting
//! entry and the last ending entry that can be reached by a consistent
//! backward walk is exposed. Bytes after that range stay in the ring for the
//! next snapshot.

use std::io;

use tracing::warn;

use crate::abstract_entry::{AbstractEntry, FormatEntry, HistogramEntry, NO_AUTHOR};
use crate::efficient_clock::{format_timestamp, ProcessTag};
use crate::entry::{EntryIterator, Event, Payload, OVERHEAD};
use crate::fifo::{FifoReader, SharedRegion};
use crate::performance::PerformanceAnalysis;

/// Entries that may open a logical event.
const STARTING_TYPES: [Event; 3] = [Event::StartFmt, Event::HistogramEntryTs, Event::AudioState];

/// Entries that may close a logical event.
const ENDING_TYPES: [Event; 3] = [Event::EndFmt, Event::HistogramEntryTs, Event::AudioState];

/// A private copy of readable ring bytes with the trustworthy range marked.
#[derive(Debug, Default)]
pub struct Snapshot {
    data: Vec<u8>,
    begin: usize,
    end: usize,
    lost: usize,
}

impl Snapshot {
    /// A snapshot with no entries.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wraps already-validated bytes; the whole buffer is treated as the
    /// entry range.
    pub fn from_entries(data: Vec<u8>) -> Self {
        let end = data.len();
        Self { data, begin: 0, end, lost: 0 }
    }

    /// Every byte copied out of the ring, including excluded head and tail.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn begin(&self) -> EntryIterator<'_> {
        EntryIterator::new(&self.data, self.begin)
    }

    pub fn end(&self) -> EntryIterator<'_> {
        EntryIterator::new(&self.data, self.end)
    }

    /// Bytes the writer overwrote before they could be read.
    pub fn lost(&self) -> usize {
        self.lost
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Logical events within the validated range. Entries that cannot start
    /// an event are skipped.
    pub fn entries(&self) -> SnapshotEntries<'_> {
        SnapshotEntries {
            it: self.begin(),
            end: self.end,
        }
    }
}

/// Iterator returned by [`Snapshot::entries`].
pub struct SnapshotEntries<'a> {
    it: EntryIterator<'a>,
    end: usize,
}

impl<'a> Iterator for SnapshotEntries<'a> {
    type Item = AbstractEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = next_event(&mut self.it, self.end)?;
        self.it = skip_event(&entry, self.end);
        Some(entry)
    }
}

/// Moves `it` forward to the next entry that starts a logical event before
/// `end`.
pub(crate) fn next_event<'a>(it: &mut EntryIterator<'a>, end: usize) -> Option<AbstractEntry<'a>> {
    while it.position() < end {
        if let Some(entry) = AbstractEntry::build(*it) {
            return Some(entry);
        }
        it.advance();
    }
    None
}

fn skip_event<'a>(entry: &AbstractEntry<'a>, end: usize) -> EntryIterator<'a> {
    let mut it = entry.begin();
    if let AbstractEntry::Format(_) = entry {
        while it.position() < end && it.event() != Some(Event::EndFmt) {
            it.advance();
        }
    }
    it.advance();
    it
}

/// Walks backwards from `back` and returns the offset of the last entry whose
/// type is in `types`.
///
/// Every step is checked: the previous entry must lie within `[front, back)`
/// and its leading length must land exactly on `back`. Any inconsistency ends
/// the search with `None`.
fn find_last_entry_of_types(buf: &[u8], front: usize, mut back: usize, types: &[Event]) -> Option<usize> {
    while back > front {
        let prev_length = *buf.get(back - 1)? as usize;
        let prev = back.checked_sub(prev_length + OVERHEAD)?;
        if prev < front {
            return None;
        }
        let it = EntryIterator::new(&buf[..back], prev);
        if !it.has_consistent_length() || it.next_entry().position() != back {
            return None;
        }
        if it.event().is_some_and(|e| types.contains(&e)) {
            return Some(prev);
        }
        back = prev;
    }
    None
}

/// Receives rendered dump lines.
pub trait DumpSink {
    fn dump_line(&mut self, line: &str);
}

impl DumpSink for Vec<String> {
    fn dump_line(&mut self, line: &str) {
        self.push(line.to_owned());
    }
}

impl DumpSink for String {
    fn dump_line(&mut self, line: &str) {
        self.push_str(line);
        self.push('\n');
    }
}

/// Writes each line, newline-terminated, to any [`io::Write`].
pub struct WriteSink<W: io::Write>(pub W);

impl<W: io::Write> DumpSink for WriteSink<W> {
    fn dump_line(&mut self, line: &str) {
        if let Err(err) = writeln!(self.0, "{}", line) {
            warn!(%err, "failed to write dump line");
        }
    }
}

/// Forwards lines to the `log` facade at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLogSink;

impl DumpSink for SystemLogSink {
    fn dump_line(&mut self, line: &str) {
        log::info!(target: "nblog", "{}", line);
    }
}

/// Resolves author indices stamped by a merger into display names.
pub trait AuthorNames {
    fn author_name(&self, author: usize) -> Option<String>;
}

/// Reads one ring.
///
/// Not thread-safe: each reader keeps its own position in the ring and must
/// be used by one thread at a time.
pub struct Reader {
    fifo: Option<FifoReader>,
    analysis: PerformanceAnalysis,
}

impl Reader {
    /// Attaches a reader starting at the oldest data still in `region`.
    pub fn new(region: SharedRegion) -> Self {
        Self {
            fifo: Some(FifoReader::new(region)),
            analysis: PerformanceAnalysis::new(),
        }
    }

    /// A reader with no ring; every snapshot is empty.
    pub fn detached() -> Self {
        Self {
            fifo: None,
            analysis: PerformanceAnalysis::new(),
        }
    }

    /// Whether this reader drains `region`.
    pub fn is_region(&self, region: &SharedRegion) -> bool {
        self.fifo
            .as_ref()
            .is_some_and(|fifo| fifo.region().same_region(region))
    }

    pub fn analysis(&self) -> &PerformanceAnalysis {
        &self.analysis
    }

    /// Copies everything readable and bounds the trustworthy entries.
    ///
    /// The ring is advanced only up to the end of the last complete event;
    /// anything after it is picked up by a later snapshot.
    pub fn get_snapshot(&mut self) -> Snapshot {
        let Some(fifo) = self.fifo.as_mut() else {
            return Snapshot::empty();
        };
        let capacity = fifo.capacity();
        let obtained = fifo.obtain(capacity);
        if obtained.available == 0 {
            return Snapshot::empty();
        }
        let mut data = vec![0u8; obtained.available];
        let first = fifo.copy_out(obtained.iovec[0], &mut data);
        fifo.copy_out(obtained.iovec[1], &mut data[first..]);

        let front = 0;
        let (begin, end) = match find_last_entry_of_types(&data, front, data.len(), &ENDING_TYPES) {
            None => (front, front),
            Some(last_end) => {
                let end = EntryIterator::new(&data, last_end).next_entry().position();
                let mut first_start = None;
                let mut back = end;
                while let Some(start) = find_last_entry_of_types(&data, front, back, &STARTING_TYPES) {
                    first_start = Some(start);
                    back = start;
                }
                (first_start.unwrap_or(end), end)
            }
        };

        fifo.release(end - front);
        Snapshot {
            data,
            begin,
            end,
            lost: obtained.lost,
        }
    }

    /// Takes a snapshot and renders it to `sink`.
    pub fn dump(&mut self, sink: &mut dyn DumpSink, indent: usize) {
        let snapshot = self.get_snapshot();
        self.dump_snapshot(sink, indent, &snapshot, None);
    }

    /// Renders `snapshot` to `sink`, one line per formatted event.
    ///
    /// Histogram ticks feed the performance analysis, whose report is appended
    /// at the end. A loss warning comes first if bytes were overwritten or
    /// excluded at the head of the snapshot.
    pub fn dump_snapshot(
        &mut self,
        sink: &mut dyn DumpSink,
        indent: usize,
        snapshot: &Snapshot,
        authors: Option<&dyn AuthorNames>,
    ) {
        let mut out = LineWriter { sink, indent, timestamp: String::new() };
        let lost = snapshot.lost() + snapshot.begin;
        if lost > 0 {
            out.line(&format!("warning: lost {} bytes worth of events", lost));
        }

        let end = snapshot.end;
        let mut it = snapshot.begin();
        while it.position() < end {
            match it.event() {
                Some(Event::StartFmt) => {
                    let mut body = String::new();
                    it = handle_format(FormatEntry::new(it), end, &mut out.timestamp, &mut body, authors);
                    out.line(&body);
                }
                Some(Event::HistogramEntryTs) => {
                    let tick = HistogramEntry::new(it);
                    self.analysis.log_ts_entry(tick.author(), tick.hash(), tick.timestamp());
                    it.advance();
                }
                Some(Event::AudioState) => {
                    self.analysis.handle_state_change(HistogramEntry::new(it).author());
                    it.advance();
                }
                Some(Event::EndFmt) => {
                    out.line("warning: got to end format event");
                    it.advance();
                }
                _ => {
                    out.line(&format!("warning: unexpected event {}", it.raw_type()));
                    it.advance();
                }
            }
        }
        for line in self.analysis.report() {
            out.line(&line);
        }
    }
}

struct LineWriter<'s> {
    sink: &'s mut dyn DumpSink,
    indent: usize,
    timestamp: String,
}

impl LineWriter<'_> {
    fn line(&mut self, body: &str) {
        let line = if self.timestamp.is_empty() {
            format!("{:indent$}{}", "", body, indent = self.indent)
        } else {
            format!("{:indent$}{} {}", "", self.timestamp, body, indent = self.indent)
        };
        self.sink.dump_line(&line);
    }
}

fn expect_kind(actual: Option<Event>, expected: Event, specifier: u8) {
    if actual != Some(expected) {
        warn!(?actual, specifier = %(specifier as char), "incompatible event for format specifier");
    }
}

fn append_argument(body: &mut String, arg: &EntryIterator<'_>) {
    let data = arg.data();
    match arg.event() {
        Some(Event::String) => body.push_str(&String::from_utf8_lossy(data)),
        Some(Event::Timestamp) => {
            let ts = i64::read_from(data).unwrap_or(0);
            body.push_str(&format_timestamp(ts));
        }
        Some(Event::Integer) => {
            let x = i64::read_from(data).unwrap_or(0);
            body.push_str(&format!("<{}>", x));
        }
        Some(Event::Float) => {
            let x = f32::read_from(data).unwrap_or(0.0);
            body.push_str(&format!("<{:.6}>", x));
        }
        Some(Event::Pid) => match ProcessTag::from_bytes(data) {
            Some(tag) => body.push_str(&format!("<PID: {}, name: {}>", tag.pid, tag.name)),
            None => body.push_str("<PID: ?>"),
        },
        other => {
            warn!(?other, "unexpected argument entry");
            body.push_str(&format!("<event {}>", arg.raw_type()));
        }
    }
}

/// Renders one formatted event into `timestamp` and `body`, returning a cursor
/// past its `EndFmt`. Nothing at or beyond `end` is read.
fn handle_format<'a>(
    entry: FormatEntry<'a>,
    end: usize,
    timestamp: &mut String,
    body: &mut String,
    authors: Option<&dyn AuthorNames>,
) -> EntryIterator<'a> {
    *timestamp = format_timestamp(entry.timestamp());

    // only 32 bits of the hash: the file part as hex, the line as decimal
    let hash = entry.hash();
    body.push_str(&format!("{:04X}-{} ", (hash >> 16) & 0xFFFF, hash & 0xFFFF));

    let author = entry.author();
    if let Some(names) = authors {
        if author != NO_AUTHOR {
            let name = usize::try_from(author)
                .ok()
                .and_then(|a| names.author_name(a))
                .unwrap_or_else(|| format!("<author {}>", author));
            body.push_str(&name);
            body.push_str(": ");
        }
    }

    let fmt = entry.format_string();
    let mut arg = entry.args();
    let mut literal_start = 0;
    let mut i = 0;
    while i < fmt.len() {
        if fmt[i] != b'%' {
            i += 1;
            continue;
        }
        body.push_str(&String::from_utf8_lossy(&fmt[literal_start..i]));
        i += 1;
        literal_start = i + 1;
        let Some(&spec) = fmt.get(i) else {
            break;
        };
        i += 1;
        match spec {
            b'%' => {
                body.push('%');
                continue;
            }
            b's' | b't' | b'd' | b'f' | b'p' => {}
            other => {
                warn!(specifier = other, "unknown format specifier");
                body.push('%');
                // the specifier byte stays in the literal run
                literal_start = i - 1;
                continue;
            }
        }
        if arg.position() >= end || arg.event() == Some(Event::EndFmt) {
            literal_start = fmt.len();
            break;
        }
        let expected = match spec {
            b's' => Event::String,
            b't' => Event::Timestamp,
            b'd' => Event::Integer,
            b'f' => Event::Float,
            _ => Event::Pid,
        };
        expect_kind(arg.event(), expected, spec);
        append_argument(body, &arg);
        arg.advance();
    }
    if literal_start < fmt.len() {
        body.push_str(&String::from_utf8_lossy(&fmt[literal_start..]));
    }

    if arg.position() < end && arg.event() != Some(Event::EndFmt) {
        warn!(event = arg.raw_type(), "expected end of format");
        while arg.position() < end && arg.event() != Some(Event::EndFmt) {
            arg.advance();
        }
    }
    arg.advance();
    arg
}
