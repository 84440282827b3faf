//! Accumulates histogram ticks into per-source period histograms.
//!
//! Producers emit a `HistogramEntryTs` tick every time a periodic piece of
//! work runs. The gaps between consecutive ticks of one source are the
//! periods; a long period means the work was late. An `AudioState` entry
//! marks a state change (for example, output stopped), after which the next
//! gap is not a real period and is skipped.

use std::collections::BTreeMap;

use crate::entry::LogHash;

/// Width of one histogram bucket, in milliseconds.
pub const BUCKET_WIDTH_MS: i64 = 1;

#[derive(Debug, Default)]
struct SourceTimes {
    last_ts: Option<i64>,
    periods_ns: Vec<i64>,
}

/// Period statistics for every `(author, hash)` tick source seen by a reader.
#[derive(Debug, Default)]
pub struct PerformanceAnalysis {
    sources: BTreeMap<(i32, LogHash), SourceTimes>,
}

impl PerformanceAnalysis {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a tick at `ts` nanoseconds.
    pub fn log_ts_entry(&mut self, author: i32, hash: LogHash, ts: i64) {
        let source = self.sources.entry((author, hash)).or_default();
        if let Some(last) = source.last_ts {
            if ts >= last {
                source.periods_ns.push(ts - last);
            }
        }
        source.last_ts = Some(ts);
    }

    /// Breaks the tick runs of every source belonging to `author`.
    pub fn handle_state_change(&mut self, author: i32) {
        for ((a, _), source) in self.sources.iter_mut() {
            if *a == author {
                source.last_ts = None;
            }
        }
    }

    /// Number of periods collected for one source since the last report.
    pub fn period_count(&self, author: i32, hash: LogHash) -> usize {
        self.sources
            .get(&(author, hash))
            .map_or(0, |s| s.periods_ns.len())
    }

    /// Renders one summary line and one histogram line per source that has
    /// periods, then forgets those periods.
    pub fn report(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        for ((author, hash), source) in self.sources.iter_mut() {
            if source.periods_ns.is_empty() {
                continue;
            }
            let count = source.periods_ns.len();
            let total: i64 = source.periods_ns.iter().sum();
            let max = source.periods_ns.iter().copied().max().unwrap_or(0);
            let mut summary = format!("histogram {:04X}-{}", (hash >> 16) & 0xFFFF, hash & 0xFFFF);
            if *author >= 0 {
                summary.push_str(&format!(" author {}", author));
            }
            summary.push_str(&format!(
                ": {} periods, mean {:.3} ms, max {:.3} ms",
                count,
                total as f64 / count as f64 / 1e6,
                max as f64 / 1e6
            ));
            lines.push(summary);

            let mut buckets: BTreeMap<i64, usize> = BTreeMap::new();
            for period in &source.periods_ns {
                *buckets.entry(period / 1_000_000 / BUCKET_WIDTH_MS).or_default() += 1;
            }
            let histogram: Vec<String> = buckets
                .iter()
                .map(|(bucket, n)| format!("{}ms:{}", bucket * BUCKET_WIDTH_MS, n))
                .collect();
            lines.push(format!("  {}", histogram.join(" ")));
            source.periods_ns.clear();
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_periods_per_source() {
        let mut analysis = PerformanceAnalysis::new();
        for i in 0..5 {
            analysis.log_ts_entry(0, 7, i * 4 * MS);
        }
        analysis.log_ts_entry(1, 7, 0);
        analysis.log_ts_entry(1, 7, 10 * MS);
        assert_eq!(analysis.period_count(0, 7), 4);
        assert_eq!(analysis.period_count(1, 7), 1);

        let lines = analysis.report();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "histogram 0000-7 author 0: 4 periods, mean 4.000 ms, max 4.000 ms");
        assert_eq!(lines[1], "  4ms:4");
        assert_eq!(lines[3], "  10ms:1");
        assert_eq!(analysis.period_count(0, 7), 0);
        assert!(analysis.report().is_empty());
    }

    #[test]
    fn test_state_change_breaks_run() {
        let mut analysis = PerformanceAnalysis::new();
        analysis.log_ts_entry(-1, 1, 0);
        analysis.log_ts_entry(-1, 1, 4 * MS);
        analysis.handle_state_change(-1);
        analysis.log_ts_entry(-1, 1, 500 * MS);
        analysis.log_ts_entry(-1, 1, 504 * MS);
        assert_eq!(analysis.period_count(-1, 1), 2);
        let lines = analysis.report();
        assert_eq!(lines[0], "histogram 0000-1: 2 periods, mean 4.000 ms, max 4.000 ms");
    }
}
