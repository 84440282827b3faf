use std::sync::Arc;
use std::thread;

use nblog::entry::{EntryIterator, Event, MAX_LENGTH, OVERHEAD};
use nblog::{log_format, log_hash, LockedWriter, Reader, SharedRegion, Writer};

fn written(region: &SharedRegion) -> u64 {
    region.written()
}

#[test]
fn test_oversized_payload_is_dropped() {
    let region = SharedRegion::new(4096);
    let mut writer = Writer::new(region.clone());
    writer.log(Event::String, &[b'x'; MAX_LENGTH + 1]);
    assert_eq!(written(&region), 0, "Oversized entries must not reach the ring");

    writer.log(Event::String, &[b'x'; MAX_LENGTH]);
    assert_eq!(written(&region), (MAX_LENGTH + OVERHEAD) as u64);
}

#[test]
fn test_long_strings_are_truncated() {
    let region = SharedRegion::new(4096);
    let mut writer = Writer::new(region.clone());
    writer.log_string(&"y".repeat(1000));
    writer.logf(format_args!("{}", "z".repeat(1000)));
    assert_eq!(written(&region), 2 * (MAX_LENGTH + OVERHEAD) as u64);
}

#[test]
fn test_reserved_event_is_dropped() {
    let region = SharedRegion::new(256);
    let mut writer = Writer::new(region.clone());
    writer.log(Event::Reserved, b"nope");
    writer.log(Event::UpperBound, b"nope");
    assert_eq!(written(&region), 0);
}

#[test]
fn test_disabled_writer_writes_nothing() {
    let region = SharedRegion::new(256);
    let mut writer = Writer::new(region.clone());
    assert!(writer.set_enabled(false), "Writers start enabled");
    writer.log_string("hidden");
    log_format!(writer, "hidden %d", log_hash!(), 1);
    assert_eq!(written(&region), 0);

    writer.set_enabled(true);
    writer.log_string("shown");
    assert!(written(&region) > 0);
}

#[test]
fn test_detached_writer_cannot_be_enabled() {
    let mut writer = Writer::detached();
    assert!(!writer.is_enabled());
    writer.set_enabled(true);
    assert!(!writer.is_enabled(), "A writer without a ring stays disabled");
    writer.log_string("into the void");
}

#[test]
fn test_composite_layout() {
    let region = SharedRegion::new(4096);
    let mut writer = Writer::new(region.clone());
    log_format!(writer, "%s=%d (%f) at %t by %p", log_hash!(), "depth", 3, 1.25f32, 99i64);

    let mut reader = Reader::new(region);
    let snapshot = reader.get_snapshot();
    let data = snapshot.data();
    let mut kinds = Vec::new();
    let mut it = EntryIterator::new(data, 0);
    while it.position() < data.len() {
        kinds.push(it.event().unwrap());
        it.advance();
    }
    assert_eq!(
        kinds,
        vec![
            Event::StartFmt,
            Event::Timestamp,
            Event::Hash,
            Event::String,
            Event::Integer,
            Event::Float,
            Event::Timestamp,
            Event::Pid,
            Event::EndFmt,
        ]
    );
}

#[test]
fn test_locked_writer_keeps_composites_whole() {
    let region = SharedRegion::new(64 * 1024);
    let writer = Arc::new(LockedWriter::new(region.clone()));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for i in 0..50 {
                    log_format!(writer, "thread %d event %d", log_hash!(), t, i);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut reader = Reader::new(region);
    let mut lines: Vec<String> = Vec::new();
    reader.dump(&mut lines, 0);
    assert_eq!(lines.len(), 200, "Every composite should decode as one line");
    for t in 0..4 {
        let count = lines
            .iter()
            .filter(|l| l.contains(&format!("thread <{}> event", t)))
            .count();
        assert_eq!(count, 50);
    }
}

#[test]
fn test_histogram_tick_shape() {
    let region = SharedRegion::new(256);
    let mut writer = Writer::new(region.clone());
    writer.log_event_hist_ts(Event::HistogramEntryTs, 0x1234);
    assert_eq!(written(&region), (16 + OVERHEAD) as u64);
}
