use std::env;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nblog::entry::Event;
use nblog::{
    log_format, log_hash, LockedWriter, MergeReader, MergeThread, MergeThreadConfig, Merger, NamedReader, Reader,
    SharedRegion, WriteSink,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const SOURCES: [&str; 3] = ["mixer", "capture", "effects"];
const RING_CAPACITY: usize = 8 * 1024;
const EVENTS_PER_SOURCE: i64 = 20;
const DUMP_PERIOD: Duration = Duration::from_millis(40);

fn setup_logging() -> tracing_appender::non_blocking::WorkerGuard {
    // stdout carries the dump, diagnostics go to stderr
    let (writer, guard) = tracing_appender::non_blocking(io::stderr());
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(writer)
        .with_target(true)
        .init();
    guard
}

fn open_region(dir: Option<&PathBuf>, name: &str) -> io::Result<SharedRegion> {
    match dir {
        Some(dir) => SharedRegion::map_file(dir.join(format!("{}.ring", name)), RING_CAPACITY),
        None => Ok(SharedRegion::new(RING_CAPACITY)),
    }
}

fn produce(writer: &LockedWriter, merge_thread: &MergeThread, source: usize) {
    let tick = log_hash!();
    for i in 0..EVENTS_PER_SOURCE {
        log_format!(writer, "%s: buffer %d took %f ms", log_hash!(), SOURCES[source], i, 0.5 * (source as f64 + 1.0));
        writer.log_event_hist_ts(Event::HistogramEntryTs, tick);
        if i % 5 == 4 {
            merge_thread.wakeup();
        }
        thread::sleep(Duration::from_millis(2 + source as u64));
    }
    log_format!(writer, "%p finished after %d events", log_hash!(), EVENTS_PER_SOURCE);
    writer.log_event_hist_ts(Event::AudioState, tick);
}

fn main() -> io::Result<()> {
    let _guard = setup_logging();
    let dir = env::args().nth(1).map(PathBuf::from);
    if let Some(dir) = &dir {
        std::fs::create_dir_all(dir)?;
        info!(dir = %dir.display(), "mapping rings from files");
    }

    let merger = Arc::new(Merger::new());
    let mut writers = Vec::with_capacity(SOURCES.len());
    for name in SOURCES {
        let region = open_region(dir.as_ref(), name)?;
        merger.add_reader(NamedReader::new(Reader::new(region.clone()), name));
        writers.push(LockedWriter::new(region));
    }

    let config = MergeThreadConfig {
        sleep_period: Duration::from_millis(20),
        wakeup_period: Duration::from_millis(100),
    };
    let merge_thread = MergeThread::spawn(Arc::clone(&merger), config)?;
    let mut merge_reader = MergeReader::new(Arc::clone(&merger));
    let mut out = WriteSink(io::stdout().lock());

    let waker = &merge_thread;
    thread::scope(|scope| {
        let producers: Vec<_> = writers
            .iter()
            .enumerate()
            .map(move |(source, writer)| scope.spawn(move || produce(writer, waker, source)))
            .collect();
        while !producers.iter().all(|p| p.is_finished()) {
            thread::sleep(DUMP_PERIOD);
            merge_reader.dump(&mut out, 0);
        }
    });

    drop(merge_thread);
    merger.merge();
    merge_reader.dump(&mut out, 0);
    Ok(())
}
