//! Shared test utilities for container round-trip tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Unique temp-file path for one test; the caller removes it when done.
pub(crate) fn tmp_path(name: &str) -> PathBuf {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!("posemap-{}-{n}-{name}", std::process::id()))
}

/// Unique temp-directory path; created empty, the caller removes it.
pub(crate) fn tmp_dir(name: &str) -> PathBuf {
    let dir = tmp_path(name);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}
