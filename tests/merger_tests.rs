use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nblog::entry::{Entry, Event, HistTsEntry};
use nblog::{
    log_format, log_hash, AbstractEntry, FifoWriter, MergeReader, MergeThread, MergeThreadConfig, Merger,
    NamedReader, Reader, SharedRegion, Writer,
};

fn push(out: &mut Vec<u8>, event: Event, data: &[u8]) {
    Entry::new(event, data).unwrap().encode_into(out);
}

/// A ring holding one formatted event per timestamp.
fn source_with(timestamps: &[i64]) -> SharedRegion {
    let region = SharedRegion::new(2048);
    let mut writer = FifoWriter::new(region.clone());
    for &ts in timestamps {
        let mut out = Vec::new();
        push(&mut out, Event::StartFmt, b"at %d");
        push(&mut out, Event::Timestamp, &ts.to_le_bytes());
        push(&mut out, Event::Hash, &0x42u64.to_le_bytes());
        push(&mut out, Event::Integer, &ts.to_le_bytes());
        push(&mut out, Event::EndFmt, b"");
        writer.write(&out);
    }
    region
}

fn merged_events(merger: &Merger) -> Vec<(i64, i32)> {
    let mut reader = Reader::new(merger.region().clone());
    let snapshot = reader.get_snapshot();
    snapshot.entries().map(|e| (e.timestamp(), e.author())).collect()
}

#[test]
fn test_merge_ordering() {
    let merger = Merger::new();
    merger.add_reader(NamedReader::new(Reader::new(source_with(&[10, 30, 50])), "a"));
    merger.add_reader(NamedReader::new(Reader::new(source_with(&[20, 40])), "b"));
    merger.add_reader(NamedReader::new(Reader::new(source_with(&[15, 25, 60])), "c"));
    merger.merge();

    assert_eq!(
        merged_events(&merger),
        vec![(10, 0), (15, 2), (20, 1), (25, 2), (30, 0), (40, 1), (50, 0), (60, 2)]
    );
}

#[test]
fn test_merge_drains_sources() {
    let merger = Merger::new();
    let region = source_with(&[1, 2]);
    merger.add_reader(NamedReader::new(Reader::new(region.clone()), "only"));
    merger.merge();
    merger.merge();
    assert_eq!(merged_events(&merger), vec![(1, 0), (2, 0)], "A second pass must not duplicate events");

    FifoWriter::new(region).write(&{
        let mut out = Vec::new();
        push(&mut out, Event::HistogramEntryTs, &HistTsEntry { hash: 1, ts: 3 }.to_bytes());
        out
    });
    merger.merge();
    assert_eq!(merged_events(&merger), vec![(1, 0), (2, 0), (3, 0)]);
}

#[test]
fn test_merged_histogram_ticks_carry_author() {
    let merger = Merger::new();
    let region = SharedRegion::new(1024);
    let mut writer = Writer::new(region.clone());
    writer.log_event_hist_ts(Event::HistogramEntryTs, 7);
    merger.add_reader(NamedReader::new(Reader::new(SharedRegion::new(64)), "silent"));
    merger.add_reader(NamedReader::new(Reader::new(region), "ticking"));
    merger.merge();

    let mut reader = Reader::new(merger.region().clone());
    let snapshot = reader.get_snapshot();
    let entries: Vec<_> = snapshot.entries().collect();
    assert_eq!(entries.len(), 1);
    match entries[0] {
        AbstractEntry::Histogram(tick) => {
            assert_eq!(tick.author(), 1);
            assert_eq!(tick.hash(), 7);
            assert_eq!(tick.begin().length(), 20, "Tagged ticks grow to the with-author payload");
        }
        AbstractEntry::Format(_) => panic!("expected a histogram tick"),
    }
}

#[test]
fn test_merge_reader_renders_author_names() {
    let merger = Arc::new(Merger::new());
    let mixer = SharedRegion::new(1024);
    let capture = SharedRegion::new(1024);
    merger.add_reader(NamedReader::new(Reader::new(mixer.clone()), "mixer"));
    merger.add_reader(NamedReader::new(Reader::new(capture.clone()), "capture"));

    let mut w1 = Writer::new(mixer);
    let mut w2 = Writer::new(capture);
    log_format!(w1, "mix %d", log_hash!(), 1);
    log_format!(w2, "cap %d", log_hash!(), 2);
    merger.merge();

    let mut lines: Vec<String> = Vec::new();
    MergeReader::new(Arc::clone(&merger)).dump(&mut lines, 0);
    assert_eq!(lines.len(), 2);
    assert!(lines[0].ends_with("mixer: mix <1>"), "got {:?}", lines[0]);
    assert!(lines[1].ends_with("capture: cap <2>"), "got {:?}", lines[1]);
    let names: Vec<String> = merger.named_readers().iter().map(|r| r.name().to_owned()).collect();
    assert_eq!(names, vec!["mixer", "capture"]);
}

#[test]
fn test_merge_thread_merges_after_wakeup() {
    let merger = Arc::new(Merger::new());
    let region = SharedRegion::new(1024);
    merger.add_reader(NamedReader::new(Reader::new(region.clone()), "src"));
    let config = MergeThreadConfig {
        sleep_period: Duration::from_millis(5),
        wakeup_period: Duration::from_millis(50),
    };
    let merge_thread = MergeThread::spawn(Arc::clone(&merger), config).unwrap();

    let mut writer = Writer::new(region);
    log_format!(writer, "wake %d", log_hash!(), 1);
    thread::sleep(Duration::from_millis(30));
    assert_eq!(merger.region().written(), 0, "An idle merge thread must not merge");

    merge_thread.wakeup();
    let deadline = Instant::now() + Duration::from_secs(5);
    while merger.region().written() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(merger.region().written() > 0, "A wakeup should trigger a merge pass");
    drop(merge_thread);
}

#[test]
fn test_merge_thread_drop_joins_idle_thread() {
    let merger = Arc::new(Merger::new());
    let merge_thread = MergeThread::spawn(Arc::clone(&merger), MergeThreadConfig::default()).unwrap();
    assert_eq!(merge_thread.config(), MergeThreadConfig::default());
    let start = Instant::now();
    drop(merge_thread);
    assert!(start.elapsed() < Duration::from_secs(1), "Dropping must not wait for a sleep period");
    assert_eq!(Arc::strong_count(&merger), 1);
}

#[test]
fn test_merge_thread_rejects_zero_sleep_period() {
    let config = MergeThreadConfig {
        sleep_period: Duration::ZERO,
        wakeup_period: Duration::from_millis(10),
    };
    let err = MergeThread::spawn(Arc::new(Merger::new()), config).err().unwrap();
    assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
}

fn wait_for_written(merger: &Merger, above: u64) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(5);
    while merger.region().written() <= above && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    merger.region().written()
}

#[test]
fn test_merge_thread_returns_to_idle_after_window() {
    let merger = Arc::new(Merger::new());
    let region = SharedRegion::new(1024);
    merger.add_reader(NamedReader::new(Reader::new(region.clone()), "src"));
    let config = MergeThreadConfig {
        sleep_period: Duration::from_millis(5),
        wakeup_period: Duration::from_millis(20),
    };
    let merge_thread = MergeThread::spawn(Arc::clone(&merger), config).unwrap();
    let mut writer = Writer::new(region);

    log_format!(writer, "first %d", log_hash!(), 1);
    merge_thread.wakeup();
    let after_first = wait_for_written(&merger, 0);
    assert!(after_first > 0, "A wakeup should trigger a merge pass");

    // well past the active window
    thread::sleep(Duration::from_millis(200));
    log_format!(writer, "second %d", log_hash!(), 2);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(
        merger.region().written(),
        after_first,
        "An expired window must not merge new data"
    );

    merge_thread.wakeup();
    assert!(wait_for_written(&merger, after_first) > after_first, "The next wakeup should merge again");
}
