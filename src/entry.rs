//! Wire format of a single log entry and a cursor that walks entries in both
//! directions.
//!
//! Every entry is laid out as:
//!
//! ```text
//! [type(1) | length(1) | data(length) | length(1)]
//! ```
//!
//! The trailing length byte duplicates the leading one. Reading the byte just
//! before an entry therefore yields the length of the previous entry, which is
//! what lets a reader walk backwards from an arbitrary offset and detect a
//! torn record without any side index.

use thiserror::Error;

/// Identifier correlating every instance of one log call site.
pub type LogHash = u64;

/// Bytes added to the payload: type, leading length, trailing length.
pub const OVERHEAD: usize = 3;

/// Largest payload an entry may carry. The length is stored in one byte and a
/// small margin is reserved so `length + OVERHEAD` still fits in a byte.
pub const MAX_LENGTH: usize = 255 - OVERHEAD;

/// Offset of the trailing length byte of the previous entry, relative to the
/// type byte of the current one.
pub const PREVIOUS_LENGTH_OFFSET: isize = -1;

const TYPE_OFFSET: usize = 0;
const LENGTH_OFFSET: usize = 1;
const DATA_OFFSET: usize = 2;

/// Kind tag stored in the first byte of every entry.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Event {
    Reserved = 0,
    /// ASCII string, not NUL-terminated
    String,
    /// `i64` monotonic nanoseconds
    Timestamp,
    /// `i64`
    Integer,
    /// `f32`
    Float,
    /// `i32` process id followed by the process short name
    Pid,
    /// `i32` source index, only present after merging
    Author,
    /// Format string opening a composite entry
    StartFmt,
    /// `u64` call-site hash
    Hash,
    /// Histogram tick carrying a hash and a timestamp
    HistogramEntryTs,
    /// Audio on/off state change, same payload as a histogram tick
    AudioState,
    /// Closes a composite entry, empty payload
    EndFmt,
    UpperBound,
}

impl Event {
    /// Every tag in wire order, indexed by its byte value.
    const ALL: [Event; 13] = [
        Event::Reserved,
        Event::String,
        Event::Timestamp,
        Event::Integer,
        Event::Float,
        Event::Pid,
        Event::Author,
        Event::StartFmt,
        Event::Hash,
        Event::HistogramEntryTs,
        Event::AudioState,
        Event::EndFmt,
        Event::UpperBound,
    ];

    /// Decodes a type byte. Unknown values yield `None`.
    pub fn from_u8(value: u8) -> Option<Event> {
        Self::ALL.get(value as usize).copied()
    }

    /// Whether a writer may put this tag on the wire.
    pub fn is_loggable(self) -> bool {
        !matches!(self, Event::Reserved | Event::UpperBound)
    }
}

impl TryFrom<u8> for Event {
    type Error = EncodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Event::from_u8(value).ok_or(EncodeError::UnknownEvent(value))
    }
}

/// Reasons an entry cannot be encoded.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the {max} byte limit", max = MAX_LENGTH)]
    TooLong(usize),
    #[error("event {0:?} cannot be logged")]
    ReservedEvent(Event),
    #[error("unknown event tag {0}")]
    UnknownEvent(u8),
}

/// An entry that has not been serialized yet.
///
/// Borrowing the payload keeps the hot logging path free of allocations; the
/// bytes are only copied once, straight into their destination.
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    event: Event,
    data: &'a [u8],
}

impl<'a> Entry<'a> {
    /// Validates the event tag and payload length.
    ///
    /// # Errors
    ///
    /// * `EncodeError::TooLong` if `data` is longer than [`MAX_LENGTH`]
    /// * `EncodeError::ReservedEvent` for `Reserved` and `UpperBound`
    pub fn new(event: Event, data: &'a [u8]) -> Result<Self, EncodeError> {
        if data.len() > MAX_LENGTH {
            return Err(EncodeError::TooLong(data.len()));
        }
        if !event.is_loggable() {
            return Err(EncodeError::ReservedEvent(event));
        }
        Ok(Self { event, data })
    }

    pub fn event(&self) -> Event {
        self.event
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Number of bytes this entry occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        self.data.len() + OVERHEAD
    }

    /// Returns the byte at `offset` of the encoded form.
    ///
    /// Offset 0 is the type, 1 the length, `[2, length + 2)` the payload and
    /// `length + 2` the trailing length. Any further offset reads as 0.
    pub fn byte_at(&self, offset: usize) -> u8 {
        let length = self.data.len();
        if offset == TYPE_OFFSET {
            self.event as u8
        } else if offset == LENGTH_OFFSET {
            length as u8
        } else if offset < length + DATA_OFFSET {
            self.data[offset - DATA_OFFSET]
        } else if offset == length + DATA_OFFSET {
            length as u8
        } else {
            0
        }
    }

    /// Appends the encoded entry to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let length = self.data.len() as u8;
        out.reserve(self.encoded_len());
        out.push(self.event as u8);
        out.push(length);
        out.extend_from_slice(self.data);
        out.push(length);
    }
}

/// Encodes one entry into a fresh buffer.
pub fn encode(event: Event, data: &[u8]) -> Result<Vec<u8>, EncodeError> {
    let entry = Entry::new(event, data)?;
    let mut out = Vec::with_capacity(entry.encoded_len());
    entry.encode_into(&mut out);
    Ok(out)
}

/// Decodes the entry at the start of `bytes`.
///
/// Returns `None` if the buffer is too short, the tag is unknown or the two
/// length bytes disagree.
pub fn decode(bytes: &[u8]) -> Option<(Event, &[u8])> {
    let it = EntryIterator::new(bytes, 0);
    if !it.has_consistent_length() {
        return None;
    }
    Some((it.event()?, it.data()))
}

/// A value with a fixed wire shape, read out of an entry payload.
///
/// Payloads carry no alignment guarantee, so implementations copy the bytes
/// out instead of casting pointers.
pub trait Payload: Sized {
    const SIZE: usize;

    fn read_from(bytes: &[u8]) -> Option<Self>;
}

macro_rules! impl_payload {
    ($($ty:ty),*) => {$(
        impl Payload for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();

            fn read_from(bytes: &[u8]) -> Option<Self> {
                let raw: [u8; std::mem::size_of::<$ty>()] = bytes.get(..Self::SIZE)?.try_into().ok()?;
                Some(<$ty>::from_le_bytes(raw))
            }
        }
    )*};
}

impl_payload!(i32, i64, u64, f32);

/// Payload of a histogram tick or audio state entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistTsEntry {
    pub hash: LogHash,
    pub ts: i64,
}

impl HistTsEntry {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.hash.to_le_bytes());
        out[8..].copy_from_slice(&self.ts.to_le_bytes());
        out
    }
}

impl Payload for HistTsEntry {
    const SIZE: usize = 16;

    fn read_from(bytes: &[u8]) -> Option<Self> {
        Some(Self {
            hash: u64::read_from(bytes.get(0..8)?)?,
            ts: i64::read_from(bytes.get(8..16)?)?,
        })
    }
}

/// Tick payload after the merger has tagged it with its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistTsEntryWithAuthor {
    pub hash: LogHash,
    pub ts: i64,
    pub author: i32,
}

impl HistTsEntryWithAuthor {
    pub fn to_bytes(&self) -> [u8; 20] {
        let mut out = [0u8; 20];
        out[..16].copy_from_slice(&HistTsEntry { hash: self.hash, ts: self.ts }.to_bytes());
        out[16..].copy_from_slice(&self.author.to_le_bytes());
        out
    }
}

impl Payload for HistTsEntryWithAuthor {
    const SIZE: usize = 20;

    fn read_from(bytes: &[u8]) -> Option<Self> {
        let base = HistTsEntry::read_from(bytes)?;
        Some(Self {
            hash: base.hash,
            ts: base.ts,
            author: i32::read_from(bytes.get(16..20)?)?,
        })
    }
}

/// Destination for serialized entries.
///
/// Implemented by the shared queue writer and by plain byte vectors, so the
/// same copy routines serve both the merger and composite assembly.
pub trait EntrySink {
    /// Appends `bytes`, returning how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> usize;
}

impl EntrySink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> usize {
        self.extend_from_slice(bytes);
        bytes.len()
    }
}

/// Cursor over entries laid out back to back in a byte buffer.
///
/// The cursor is an offset into a borrowed buffer, so it can never outlive
/// the snapshot it points into. Moving it does no validation: callers bound
/// iteration with an end cursor obtained from a validated scan. Accessors
/// never index out of bounds; missing bytes read as zero.
#[derive(Debug, Clone, Copy)]
pub struct EntryIterator<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> EntryIterator<'a> {
    pub fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    /// Offset of the current entry's type byte within the buffer.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    fn byte(&self, offset: usize) -> u8 {
        self.buf.get(self.pos + offset).copied().unwrap_or(0)
    }

    /// Raw type byte of the current entry.
    pub fn raw_type(&self) -> u8 {
        self.byte(TYPE_OFFSET)
    }

    /// Kind of the current entry. Reserved and unknown tags yield `None`.
    pub fn event(&self) -> Option<Event> {
        Event::from_u8(self.raw_type()).filter(|e| e.is_loggable())
    }

    /// Leading length byte of the current entry.
    pub fn length(&self) -> usize {
        self.byte(LENGTH_OFFSET) as usize
    }

    /// Payload of the current entry, clipped to the buffer.
    pub fn data(&self) -> &'a [u8] {
        let start = (self.pos + DATA_OFFSET).min(self.buf.len());
        let end = (start + self.length()).min(self.buf.len());
        &self.buf[start..end]
    }

    /// Full encoded bytes of the current entry, clipped to the buffer.
    pub fn raw(&self) -> &'a [u8] {
        let start = self.pos.min(self.buf.len());
        let end = (self.pos + self.length() + OVERHEAD).min(self.buf.len());
        &self.buf[start..end]
    }

    pub fn advance(&mut self) {
        self.pos += self.length() + OVERHEAD;
    }

    /// Steps back over the previous entry using its trailing length byte.
    ///
    /// Stepping back from the start of the buffer leaves the cursor at 0.
    pub fn retreat(&mut self) {
        let prev_length = self
            .pos
            .checked_sub(1)
            .and_then(|i| self.buf.get(i))
            .copied()
            .unwrap_or(0) as usize;
        self.pos = self.pos.saturating_sub(prev_length + OVERHEAD);
    }

    pub fn next_entry(&self) -> Self {
        let mut it = *self;
        it.advance();
        it
    }

    pub fn prev_entry(&self) -> Self {
        let mut it = *self;
        it.retreat();
        it
    }

    /// True when the leading and trailing length bytes agree and the whole
    /// entry lies within the buffer.
    pub fn has_consistent_length(&self) -> bool {
        let length = self.length();
        let trailing = self.pos + length + OVERHEAD - 1;
        match self.buf.get(trailing) {
            Some(&byte) => byte as usize == length,
            None => false,
        }
    }

    /// Reads the payload as a fixed-shape value.
    ///
    /// Returns `None` when the payload size is not exactly `T::SIZE`.
    pub fn payload<T: Payload>(&self) -> Option<T> {
        if self.length() != T::SIZE {
            return None;
        }
        T::read_from(self.data())
    }

    /// Copies the current entry, overhead included, into `sink`.
    pub fn copy_to<S: EntrySink + ?Sized>(&self, sink: &mut S) -> usize {
        sink.write(self.raw())
    }

    /// Copies only the payload into `dst`, returning the number of bytes.
    pub fn copy_data(&self, dst: &mut [u8]) -> usize {
        let data = self.data();
        let n = data.len().min(dst.len());
        dst[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Signed byte distance from `other` to `self`.
    pub fn offset_from(&self, other: &EntryIterator<'_>) -> isize {
        self.pos as isize - other.pos as isize
    }
}

impl PartialEq for EntryIterator<'_> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.buf.as_ptr(), other.buf.as_ptr()) && self.pos == other.pos
    }
}

impl Eq for EntryIterator<'_> {}

/// Hashes a call site into a [`LogHash`].
///
/// The low 16 bits hold the line number so dumps show `XXXX-line`; the rest
/// is an FNV-1a hash of the file name.
pub const fn hash_call_site(file: &str, line: u32) -> LogHash {
    let bytes = file.as_bytes();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    (hash << 16) | (line as u64 & 0xFFFF)
}

/// Hash of the call site this macro expands at.
#[macro_export]
macro_rules! log_hash {
    () => {
        $crate::entry::hash_call_site(file!(), line!())
    };
}
