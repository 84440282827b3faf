//! Read-only views over one logical log event.
//!
//! A formatted message spans several wire entries between a `StartFmt` and an
//! `EndFmt`; a histogram tick or audio state change is a single entry. Both
//! shapes expose the same timestamp, hash and author accessors, and both can
//! re-serialize themselves with an author tag, which is all the merger needs.

use tracing::warn;

use crate::entry::{
    EntryIterator, EntrySink, Event, HistTsEntry, HistTsEntryWithAuthor, LogHash, Payload,
    OVERHEAD,
};

/// Author value reported for entries that were never merged.
pub const NO_AUTHOR: i32 = -1;

/// A `StartFmt ... EndFmt` run of entries.
///
/// Layout: `StartFmt(fmt) Timestamp Hash [Author] args... EndFmt`.
#[derive(Debug, Clone, Copy)]
pub struct FormatEntry<'a> {
    entry: EntryIterator<'a>,
}

impl<'a> FormatEntry<'a> {
    /// Wraps the `StartFmt` entry under `entry`.
    pub fn new(entry: EntryIterator<'a>) -> Self {
        Self { entry }
    }

    pub fn begin(&self) -> EntryIterator<'a> {
        self.entry
    }

    /// The printf-style template carried by the `StartFmt` entry.
    pub fn format_string(&self) -> &'a [u8] {
        self.entry.data()
    }

    pub fn format_string_length(&self) -> usize {
        self.entry.length()
    }

    fn timestamp_entry(&self) -> EntryIterator<'a> {
        self.entry.next_entry()
    }

    fn hash_entry(&self) -> EntryIterator<'a> {
        self.timestamp_entry().next_entry()
    }

    /// Timestamp of the event, or 0 if the entry after `StartFmt` is malformed.
    pub fn timestamp(&self) -> i64 {
        self.timestamp_entry().payload::<i64>().unwrap_or(0)
    }

    pub fn hash(&self) -> LogHash {
        self.hash_entry().payload::<u64>().unwrap_or(0)
    }

    /// Source index stamped by the merger, or [`NO_AUTHOR`].
    pub fn author(&self) -> i32 {
        let it = self.hash_entry().next_entry();
        if it.event() == Some(Event::Author) {
            return it.payload::<i32>().unwrap_or(NO_AUTHOR);
        }
        NO_AUTHOR
    }

    /// Cursor on the first argument entry.
    pub fn args(&self) -> EntryIterator<'a> {
        let mut it = self.hash_entry().next_entry();
        if it.event() == Some(Event::Author) {
            it.advance();
        }
        it
    }

    /// Writes the whole composite entry to `sink` with an `Author` entry
    /// inserted after the hash. An author already present is replaced.
    ///
    /// Returns a cursor just past the copied `EndFmt`. Copying stops at the end
    /// of the buffer if no `EndFmt` is found.
    pub fn copy_with_author<S: EntrySink + ?Sized>(&self, sink: &mut S, author: i32) -> EntryIterator<'a> {
        let limit = self.entry.buffer().len();
        let mut it = self.entry;
        // start, timestamp, hash
        for _ in 0..3 {
            it.copy_to(sink);
            it.advance();
        }
        sink.write(&author_entry(author));
        if it.event() == Some(Event::Author) {
            it.advance();
        }
        while it.position() < limit && it.event() != Some(Event::EndFmt) {
            it.copy_to(sink);
            it.advance();
        }
        if it.position() < limit {
            it.copy_to(sink);
            it.advance();
        }
        it
    }
}

fn author_entry(author: i32) -> [u8; OVERHEAD + 4] {
    let mut out = [0u8; OVERHEAD + 4];
    out[0] = Event::Author as u8;
    out[1] = 4;
    out[2..6].copy_from_slice(&author.to_le_bytes());
    out[6] = 4;
    out
}

/// A self-contained histogram tick or audio state entry.
#[derive(Debug, Clone, Copy)]
pub struct HistogramEntry<'a> {
    entry: EntryIterator<'a>,
}

impl<'a> HistogramEntry<'a> {
    pub fn new(entry: EntryIterator<'a>) -> Self {
        Self { entry }
    }

    pub fn begin(&self) -> EntryIterator<'a> {
        self.entry
    }

    fn tick(&self) -> Option<HistTsEntry> {
        HistTsEntry::read_from(self.entry.data())
    }

    pub fn timestamp(&self) -> i64 {
        self.tick().map_or(0, |t| t.ts)
    }

    pub fn hash(&self) -> LogHash {
        self.tick().map_or(0, |t| t.hash)
    }

    pub fn author(&self) -> i32 {
        self.entry
            .payload::<HistTsEntryWithAuthor>()
            .map_or(NO_AUTHOR, |t| t.author)
    }

    /// Rewrites the payload into its with-author shape and writes the single
    /// resulting entry to `sink`.
    pub fn copy_with_author<S: EntrySink + ?Sized>(&self, sink: &mut S, author: i32) -> EntryIterator<'a> {
        let tick = self.tick().unwrap_or(HistTsEntry { hash: 0, ts: 0 });
        let payload = HistTsEntryWithAuthor { hash: tick.hash, ts: tick.ts, author }.to_bytes();
        let mut out = [0u8; OVERHEAD + HistTsEntryWithAuthor::SIZE];
        out[0] = self.entry.raw_type();
        out[1] = HistTsEntryWithAuthor::SIZE as u8;
        out[2..2 + HistTsEntryWithAuthor::SIZE].copy_from_slice(&payload);
        out[OVERHEAD + HistTsEntryWithAuthor::SIZE - 1] = HistTsEntryWithAuthor::SIZE as u8;
        sink.write(&out);
        self.entry.next_entry()
    }
}

/// One logical event, whichever shape it has on the wire.
#[derive(Debug, Clone, Copy)]
pub enum AbstractEntry<'a> {
    Format(FormatEntry<'a>),
    Histogram(HistogramEntry<'a>),
}

impl<'a> AbstractEntry<'a> {
    /// Builds the view matching the tag under `it`.
    ///
    /// Returns `None` for any tag that cannot start a logical event.
    pub fn build(it: EntryIterator<'a>) -> Option<Self> {
        match it.event() {
            Some(Event::StartFmt) => Some(AbstractEntry::Format(FormatEntry::new(it))),
            Some(Event::HistogramEntryTs) | Some(Event::AudioState) => {
                Some(AbstractEntry::Histogram(HistogramEntry::new(it)))
            }
            _ => {
                warn!(event = it.raw_type(), "cannot build a log event from this entry");
                None
            }
        }
    }

    pub fn begin(&self) -> EntryIterator<'a> {
        match self {
            AbstractEntry::Format(e) => e.begin(),
            AbstractEntry::Histogram(e) => e.begin(),
        }
    }

    pub fn timestamp(&self) -> i64 {
        match self {
            AbstractEntry::Format(e) => e.timestamp(),
            AbstractEntry::Histogram(e) => e.timestamp(),
        }
    }

    pub fn hash(&self) -> LogHash {
        match self {
            AbstractEntry::Format(e) => e.hash(),
            AbstractEntry::Histogram(e) => e.hash(),
        }
    }

    pub fn author(&self) -> i32 {
        match self {
            AbstractEntry::Format(e) => e.author(),
            AbstractEntry::Histogram(e) => e.author(),
        }
    }

    pub fn copy_with_author<S: EntrySink + ?Sized>(&self, sink: &mut S, author: i32) -> EntryIterator<'a> {
        match self {
            AbstractEntry::Format(e) => e.copy_with_author(sink, author),
            AbstractEntry::Histogram(e) => e.copy_with_author(sink, author),
        }
    }
}
