//! Producer side: turns log calls into entries pushed into a shared ring.
//!
//! A log call must never disturb the thread making it. Every failure on this
//! side (disabled writer, oversized payload, reserved tag, unreadable clock)
//! drops the event and returns normally.

use std::fmt;
use std::fmt::Write as _;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::efficient_clock::{get_monotonic_ns, process_tag};
use crate::entry::{Entry, Event, HistTsEntry, LogHash, MAX_LENGTH};
use crate::fifo::{FifoWriter, SharedRegion};

/// One argument of a formatted log call.
///
/// The conversion specifier in the format string decides which entry kind is
/// emitted; arguments of another kind are converted where that makes sense.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LogArg<'a> {
    Str(&'a str),
    Int(i64),
    Float(f64),
    Timestamp(i64),
}

impl<'a> From<&'a str> for LogArg<'a> {
    fn from(s: &'a str) -> Self {
        LogArg::Str(s)
    }
}

impl<'a> From<&'a String> for LogArg<'a> {
    fn from(s: &'a String) -> Self {
        LogArg::Str(s.as_str())
    }
}

macro_rules! int_log_arg {
    ($($ty:ty),*) => {$(
        impl From<$ty> for LogArg<'_> {
            fn from(v: $ty) -> Self {
                LogArg::Int(v as i64)
            }
        }
    )*};
}

int_log_arg!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<f32> for LogArg<'_> {
    fn from(v: f32) -> Self {
        LogArg::Float(v as f64)
    }
}

impl From<f64> for LogArg<'_> {
    fn from(v: f64) -> Self {
        LogArg::Float(v)
    }
}

fn push_entry(out: &mut Vec<u8>, event: Event, data: &[u8]) -> bool {
    match Entry::new(event, data) {
        Ok(entry) => {
            entry.encode_into(out);
            true
        }
        Err(err) => {
            trace!(%err, "dropping log entry");
            false
        }
    }
}

fn truncate(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(MAX_LENGTH)]
}

fn push_string(out: &mut Vec<u8>, s: &str) {
    push_entry(out, Event::String, truncate(s.as_bytes()));
}

/// Serializes a whole `StartFmt ... EndFmt` composite into `out`.
///
/// Returns `false`, leaving `out` untouched, if the clock could not be read.
fn compose_format(out: &mut Vec<u8>, pid_tag: &[u8], fmt: &str, hash: LogHash, args: &[LogArg<'_>]) -> bool {
    let Some(now) = get_monotonic_ns() else {
        warn!("failed to read the monotonic clock, dropping formatted log");
        return false;
    };
    let start = out.len();
    let fmt = truncate(fmt.as_bytes());
    if !push_entry(out, Event::StartFmt, fmt) {
        out.truncate(start);
        return false;
    }
    push_entry(out, Event::Timestamp, &now.to_le_bytes());
    push_entry(out, Event::Hash, &hash.to_le_bytes());

    let mut args = args.iter();
    let mut i = 0;
    while i < fmt.len() {
        if fmt[i] != b'%' {
            i += 1;
            continue;
        }
        i += 1;
        let Some(&spec) = fmt.get(i) else {
            break;
        };
        i += 1;
        match spec {
            b'%' => continue,
            b'p' => {
                push_entry(out, Event::Pid, pid_tag);
                continue;
            }
            b's' | b't' | b'd' | b'f' => {}
            other => {
                warn!(specifier = %(other as char), "invalid format specifier");
                continue;
            }
        }
        let Some(arg) = args.next() else {
            warn!(specifier = %(spec as char), "missing argument for format specifier");
            continue;
        };
        match *arg {
            LogArg::Str(s) => {
                if spec != b's' {
                    // keep it as text so later arguments stay aligned
                    warn!(specifier = %(spec as char), "string argument for numeric specifier");
                }
                push_string(out, s);
            }
            LogArg::Int(v) | LogArg::Timestamp(v) => match spec {
                b's' => push_string(out, &v.to_string()),
                b't' => {
                    push_entry(out, Event::Timestamp, &v.to_le_bytes());
                }
                b'd' => {
                    push_entry(out, Event::Integer, &v.to_le_bytes());
                }
                _ => {
                    push_entry(out, Event::Float, &(v as f32).to_le_bytes());
                }
            },
            LogArg::Float(v) => match spec {
                b's' => push_string(out, &v.to_string()),
                b't' => {
                    push_entry(out, Event::Timestamp, &(v as i64).to_le_bytes());
                }
                b'd' => {
                    push_entry(out, Event::Integer, &(v as i64).to_le_bytes());
                }
                _ => {
                    push_entry(out, Event::Float, &(v as f32).to_le_bytes());
                }
            },
        }
    }
    push_entry(out, Event::EndFmt, &[]);
    true
}

/// Formats `args` with Rust formatting into a string no longer than an entry
/// payload.
fn format_bounded(args: fmt::Arguments<'_>) -> String {
    let mut text = String::new();
    let _ = text.write_fmt(args);
    if text.len() > MAX_LENGTH {
        let mut cut = MAX_LENGTH;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

/// Writes entries into one shared ring.
///
/// Not thread-safe; wrap it in a [`LockedWriter`] to share it between
/// threads, or give each thread its own ring.
///
/// # Examples
///
/// ```
/// use nblog::{log_format, log_hash, Reader, SharedRegion, Writer};
///
/// let region = SharedRegion::new(4096);
/// let mut writer = Writer::new(region.clone());
/// log_format!(writer, "started %s with %d workers", log_hash!(), "pool", 4);
///
/// let mut reader = Reader::new(region);
/// let mut lines: Vec<String> = Vec::new();
/// reader.dump(&mut lines, 0);
/// assert!(lines[0].ends_with("started pool with <4> workers"));
/// ```
pub struct Writer {
    fifo: Option<FifoWriter>,
    enabled: bool,
    pid_tag: Vec<u8>,
    scratch: Vec<u8>,
}

impl Writer {
    /// Creates an enabled writer appending to `region`.
    pub fn new(region: SharedRegion) -> Self {
        Self {
            fifo: Some(FifoWriter::new(region)),
            enabled: true,
            pid_tag: process_tag().to_bytes(),
            scratch: Vec::with_capacity(4 * (MAX_LENGTH + 3)),
        }
    }

    /// A writer with no ring; every call is a no-op.
    pub fn detached() -> Self {
        Self {
            fifo: None,
            enabled: false,
            pid_tag: process_tag().to_bytes(),
            scratch: Vec::new(),
        }
    }

    pub fn region(&self) -> Option<&SharedRegion> {
        self.fifo.as_ref().map(FifoWriter::region)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables logging, returning the previous state. A detached
    /// writer stays disabled.
    pub fn set_enabled(&mut self, enabled: bool) -> bool {
        let old = self.enabled;
        self.enabled = enabled && self.fifo.is_some();
        old
    }

    fn push(&mut self, bytes: &[u8]) {
        if !self.enabled {
            return;
        }
        if let Some(fifo) = self.fifo.as_mut() {
            fifo.write(bytes);
        }
    }

    /// Logs one entry. Oversized payloads and reserved tags are dropped.
    pub fn log(&mut self, event: Event, data: &[u8]) {
        if !self.enabled {
            return;
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        if push_entry(&mut scratch, event, data) {
            self.push(&scratch);
        }
        self.scratch = scratch;
    }

    /// Logs a plain string, truncated to the payload limit.
    pub fn log_string(&mut self, s: &str) {
        self.log(Event::String, truncate(s.as_bytes()));
    }

    /// Formats with Rust formatting and logs the result as a string.
    pub fn logf(&mut self, args: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        let text = format_bounded(args);
        self.log(Event::String, text.as_bytes());
    }

    /// Logs the current monotonic time.
    pub fn log_timestamp(&mut self) {
        if !self.enabled {
            return;
        }
        match get_monotonic_ns() {
            Some(ts) => self.log_timestamp_at(ts),
            None => warn!("failed to read the monotonic clock"),
        }
    }

    pub fn log_timestamp_at(&mut self, ts: i64) {
        self.log(Event::Timestamp, &ts.to_le_bytes());
    }

    pub fn log_integer(&mut self, x: i64) {
        self.log(Event::Integer, &x.to_le_bytes());
    }

    pub fn log_float(&mut self, x: f32) {
        self.log(Event::Float, &x.to_le_bytes());
    }

    pub fn log_pid(&mut self) {
        let tag = std::mem::take(&mut self.pid_tag);
        self.log(Event::Pid, &tag);
        self.pid_tag = tag;
    }

    /// Opens a composite entry with format string `fmt`.
    pub fn log_start(&mut self, fmt: &str) {
        self.log(Event::StartFmt, truncate(fmt.as_bytes()));
    }

    pub fn log_end(&mut self) {
        self.log(Event::EndFmt, &[]);
    }

    pub fn log_hash(&mut self, hash: LogHash) {
        self.log(Event::Hash, &hash.to_le_bytes());
    }

    /// Logs a tick carrying `hash` and the current time. `event` is normally
    /// `HistogramEntryTs` or `AudioState`.
    pub fn log_event_hist_ts(&mut self, event: Event, hash: LogHash) {
        if !self.enabled {
            return;
        }
        match get_monotonic_ns() {
            Some(ts) => self.log(event, &HistTsEntry { hash, ts }.to_bytes()),
            None => warn!("failed to read the monotonic clock"),
        }
    }

    /// Logs a composite entry: the format string, the current time, `hash`,
    /// then one typed entry per conversion specifier.
    ///
    /// Supported specifiers: `%s` string, `%t` timestamp, `%d` integer,
    /// `%f` float (stored as `f32`), `%p` this process's pid and name (takes no
    /// argument), `%%` a literal percent. The composite is pushed to the ring
    /// in a single write.
    pub fn log_format(&mut self, fmt: &str, hash: LogHash, args: &[LogArg<'_>]) {
        if !self.enabled {
            return;
        }
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        if compose_format(&mut scratch, &self.pid_tag, fmt, hash, args) {
            self.push(&scratch);
        }
        self.scratch = scratch;
    }
}

impl fmt::Debug for Writer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Writer")
            .field("region", &self.region())
            .field("enabled", &self.enabled)
            .finish()
    }
}

/// A [`Writer`] shared between threads.
///
/// Serialization, formatting and clock reads happen before the lock is taken;
/// the lock only covers pushing finished bytes into the ring, so concurrent
/// callers never interleave inside one entry or composite.
pub struct LockedWriter {
    inner: Mutex<Writer>,
    pid_tag: Vec<u8>,
}

impl LockedWriter {
    pub fn new(region: SharedRegion) -> Self {
        Self::from_writer(Writer::new(region))
    }

    pub fn from_writer(writer: Writer) -> Self {
        let pid_tag = writer.pid_tag.clone();
        Self {
            inner: Mutex::new(writer),
            pid_tag,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.lock().is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.inner.lock().set_enabled(enabled)
    }

    fn push_encoded(&self, encoded: &[u8]) {
        self.inner.lock().push(encoded);
    }

    pub fn log(&self, event: Event, data: &[u8]) {
        if !self.is_enabled() {
            return;
        }
        let mut encoded = Vec::with_capacity(data.len() + 3);
        if push_entry(&mut encoded, event, data) {
            self.push_encoded(&encoded);
        }
    }

    pub fn log_string(&self, s: &str) {
        self.log(Event::String, truncate(s.as_bytes()));
    }

    pub fn logf(&self, args: fmt::Arguments<'_>) {
        if !self.is_enabled() {
            return;
        }
        let text = format_bounded(args);
        self.log(Event::String, text.as_bytes());
    }

    pub fn log_timestamp(&self) {
        match get_monotonic_ns() {
            Some(ts) => self.log_timestamp_at(ts),
            None => warn!("failed to read the monotonic clock"),
        }
    }

    pub fn log_timestamp_at(&self, ts: i64) {
        self.log(Event::Timestamp, &ts.to_le_bytes());
    }

    pub fn log_integer(&self, x: i64) {
        self.log(Event::Integer, &x.to_le_bytes());
    }

    pub fn log_float(&self, x: f32) {
        self.log(Event::Float, &x.to_le_bytes());
    }

    pub fn log_pid(&self) {
        self.log(Event::Pid, &self.pid_tag);
    }

    pub fn log_start(&self, fmt: &str) {
        self.log(Event::StartFmt, truncate(fmt.as_bytes()));
    }

    pub fn log_end(&self) {
        self.log(Event::EndFmt, &[]);
    }

    pub fn log_hash(&self, hash: LogHash) {
        self.log(Event::Hash, &hash.to_le_bytes());
    }

    pub fn log_event_hist_ts(&self, event: Event, hash: LogHash) {
        match get_monotonic_ns() {
            Some(ts) => self.log(event, &HistTsEntry { hash, ts }.to_bytes()),
            None => warn!("failed to read the monotonic clock"),
        }
    }

    pub fn log_format(&self, fmt: &str, hash: LogHash, args: &[LogArg<'_>]) {
        if !self.is_enabled() {
            return;
        }
        let mut encoded = Vec::with_capacity(4 * (MAX_LENGTH + 3));
        if compose_format(&mut encoded, &self.pid_tag, fmt, hash, args) {
            self.push_encoded(&encoded);
        }
    }
}

/// Logs a composite entry through [`Writer::log_format`] or
/// [`LockedWriter::log_format`], converting each argument into a [`LogArg`].
///
/// # Examples
///
/// ```
/// # use nblog::{log_format, log_hash, SharedRegion, Writer};
/// let mut writer = Writer::new(SharedRegion::new(1024));
/// log_format!(writer, "buffer %d of %d underran by %f ms", log_hash!(), 3, 8, 1.5);
/// log_format!(writer, "idle", log_hash!());
/// ```
#[macro_export]
macro_rules! log_format {
    ($writer:expr, $fmt:expr, $hash:expr $(, $arg:expr)* $(,)?) => {
        $writer.log_format($fmt, $hash, &[$($crate::writer::LogArg::from($arg)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryIterator, OVERHEAD};

    fn kinds(bytes: &[u8]) -> Vec<Event> {
        let mut out = Vec::new();
        let mut it = EntryIterator::new(bytes, 0);
        while it.position() < bytes.len() {
            assert!(it.has_consistent_length());
            out.push(it.event().unwrap());
            it.advance();
        }
        out
    }

    #[test]
    fn test_compose_format_emits_one_entry_per_specifier() {
        let mut out = Vec::new();
        let args = [LogArg::Str("a"), LogArg::Timestamp(5), LogArg::Int(1), LogArg::Float(0.5)];
        assert!(compose_format(&mut out, b"\x01\0\0\0x", "%s %t %d %f %p %%", 7, &args));
        assert_eq!(
            kinds(&out),
            vec![
                Event::StartFmt,
                Event::Timestamp,
                Event::Hash,
                Event::String,
                Event::Timestamp,
                Event::Integer,
                Event::Float,
                Event::Pid,
                Event::EndFmt,
            ]
        );
    }

    #[test]
    fn test_compose_format_skips_unknown_and_missing() {
        let mut out = Vec::new();
        assert!(compose_format(&mut out, b"", "%q %d %s%", 0, &[LogArg::Int(3)]));
        assert_eq!(
            kinds(&out),
            vec![Event::StartFmt, Event::Timestamp, Event::Hash, Event::Integer, Event::EndFmt]
        );
    }

    #[test]
    fn test_compose_format_coerces_arguments() {
        let mut out = Vec::new();
        let args = [LogArg::Float(2.9), LogArg::Int(4), LogArg::Str("x")];
        assert!(compose_format(&mut out, b"", "%d %s %d", 0, &args));
        let mut it = EntryIterator::new(&out, 0);
        for _ in 0..3 {
            it.advance();
        }
        assert_eq!(it.payload::<i64>(), Some(2));
        it.advance();
        assert_eq!(it.data(), b"4");
        it.advance();
        assert_eq!(it.event(), Some(Event::String));
    }

    #[test]
    fn test_long_format_string_truncated() {
        let fmt = "x".repeat(MAX_LENGTH + 40);
        let mut out = Vec::new();
        assert!(compose_format(&mut out, b"", &fmt, 0, &[]));
        assert_eq!(EntryIterator::new(&out, 0).length(), MAX_LENGTH);
    }

    #[test]
    fn test_format_bounded_respects_char_boundary() {
        let text = format_bounded(format_args!("{}", "é".repeat(MAX_LENGTH)));
        assert!(text.len() <= MAX_LENGTH);
        assert!(text.len() > MAX_LENGTH - 2);
    }

    #[test]
    fn test_detached_writer_stays_disabled() {
        let mut writer = Writer::detached();
        assert!(!writer.is_enabled());
        assert!(!writer.set_enabled(true));
        assert!(!writer.is_enabled());
        writer.log_string("nothing");
    }

    #[test]
    fn test_writer_pushes_whole_entries() {
        let region = SharedRegion::new(1024);
        let mut writer = Writer::new(region.clone());
        writer.log_string("abc");
        writer.log_integer(-1);
        assert_eq!(region.written() as usize, 3 + OVERHEAD + 8 + OVERHEAD);
        assert!(writer.set_enabled(false));
        writer.log_string("muted");
        assert_eq!(region.written() as usize, 3 + OVERHEAD + 8 + OVERHEAD);
    }
}
