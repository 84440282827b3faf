//! Host clock and process identity.
//!
//! Timestamps from different processes are merged into one timeline, so they
//! must come from a clock every process shares: `CLOCK_MONOTONIC`. Platforms
//! without it fall back to a process-local monotonic origin.

use lazy_static::lazy_static;

/// Maximum length of a process short name, as reported by the kernel.
pub const PROCESS_NAME_MAX: usize = 15;

/// Reads the monotonic clock in nanoseconds.
///
/// Returns `None` if the clock cannot be read; callers drop the event.
#[cfg(unix)]
pub fn get_monotonic_ns() -> Option<i64> {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let status = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if status != 0 {
        return None;
    }
    let ns = (ts.tv_sec as i64)
        .checked_mul(1_000_000_000)?
        .checked_add(ts.tv_nsec as i64)?;
    (ns > 0).then_some(ns)
}

#[cfg(not(unix))]
pub fn get_monotonic_ns() -> Option<i64> {
    lazy_static! {
        static ref ORIGIN: std::time::Instant = std::time::Instant::now();
    }
    // offset by one so the first reading is never 0
    i64::try_from(ORIGIN.elapsed().as_nanos()).ok().map(|ns| ns + 1)
}

/// Renders nanoseconds as `[seconds.millis]`.
pub fn format_timestamp(ns: i64) -> String {
    format!("[{}.{:03}]", ns / 1_000_000_000, (ns / 1_000_000) % 1000)
}

/// Process id plus short name, the payload of a PID entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTag {
    pub pid: i32,
    pub name: String,
}

impl ProcessTag {
    fn current() -> Self {
        Self {
            pid: std::process::id() as i32,
            name: current_process_name(),
        }
    }

    /// Wire form: little-endian `i32` pid followed by the name bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.name.len());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let pid = i32::from_le_bytes(bytes.get(..4)?.try_into().ok()?);
        Some(Self {
            pid,
            name: String::from_utf8_lossy(&bytes[4..]).into_owned(),
        })
    }
}

lazy_static! {
    static ref PROCESS_TAG: ProcessTag = ProcessTag::current();
}

/// Identity of the running process, computed once.
pub fn process_tag() -> &'static ProcessTag {
    &PROCESS_TAG
}

#[cfg(target_os = "linux")]
fn current_process_name() -> String {
    let mut name = [0u8; PROCESS_NAME_MAX + 1];
    let status = unsafe { libc::prctl(libc::PR_GET_NAME, name.as_mut_ptr() as libc::c_ulong, 0, 0, 0) };
    if status != 0 {
        return String::new();
    }
    let len = name.iter().position(|&b| b == 0).unwrap_or(PROCESS_NAME_MAX);
    String::from_utf8_lossy(&name[..len]).into_owned()
}

#[cfg(not(target_os = "linux"))]
fn current_process_name() -> String {
    let mut name = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    while name.len() > PROCESS_NAME_MAX {
        name.pop();
    }
    name
}
