use nblog::efficient_clock::{format_timestamp, get_monotonic_ns, process_tag};
use std::thread;
use std::time::Duration;

#[test]
fn test_timestamp_monotonicity() {
    let mut prev = get_monotonic_ns().unwrap();
    for _ in 0..1000 {
        let current = get_monotonic_ns().unwrap();
        assert!(current >= prev, "Timestamps should be monotonically increasing");
        prev = current;
    }
}

#[test]
fn test_timestamp_precision() {
    let start = get_monotonic_ns().unwrap();
    thread::sleep(Duration::from_millis(1));
    let end = get_monotonic_ns().unwrap();
    assert!(end - start >= 1_000_000, "A 1ms sleep should advance the clock by at least 1ms");
}

#[test]
fn test_clock_is_shared_across_threads() {
    let before = get_monotonic_ns().unwrap();
    let from_thread = thread::spawn(|| get_monotonic_ns().unwrap()).join().unwrap();
    let after = get_monotonic_ns().unwrap();
    assert!(before <= from_thread && from_thread <= after, "All threads should read the same clock");
}

#[test]
fn test_format_timestamp() {
    assert_eq!(format_timestamp(12_345_678_901), "[12.345]");
    assert_eq!(format_timestamp(999_999), "[0.000]");
}

#[test]
fn test_process_tag_is_cached() {
    let first = process_tag();
    let second = thread::spawn(|| process_tag().clone()).join().unwrap();
    assert_eq!(*first, second, "Process identity should be computed once per process");
}
