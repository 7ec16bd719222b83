// SPDX-License-Identifier: GPL-3.0-only

//! Progress reporting for long-running extractions.

use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Byte counters emitted while a partition is extracted. `add` is called
/// from worker threads concurrently; increments are commutative, so
/// implementations only need interior mutability, not ordering.
pub trait ProgressSink: Send + Sync {
    fn begin(&self, _name: &str, _total_bytes: u64) {}

    fn add(&self, _bytes: u64) {}

    fn finish(&self, _name: &str) {}
}

/// Sink that discards all updates.
pub struct NullProgress;

impl ProgressSink for NullProgress {}

struct State {
    name: String,
    done: u64,
    total: u64,
    started: Instant,
    last_render: Instant,
}

/// Single-line stderr progress meter. Shows the completed percentage and
/// the throughput averaged over the partition so far; redraws are rate
/// limited so worker threads never stall on terminal output.
pub struct ConsoleProgress {
    state: Mutex<State>,
    interval: Duration,
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl ConsoleProgress {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_millis(100))
    }

    pub fn with_interval(interval: Duration) -> Self {
        let now = Instant::now();

        Self {
            state: Mutex::new(State {
                name: String::new(),
                done: 0,
                total: 0,
                started: now,
                last_render: now - interval,
            }),
            interval,
        }
    }
}

impl Default for ConsoleProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for ConsoleProgress {
    fn begin(&self, name: &str, total_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        state.name.clear();
        state.name.push_str(name);
        state.done = 0;
        state.total = total_bytes;
        state.started = now;
        // Let the first add() render immediately.
        state.last_render = now - self.interval;
    }

    fn add(&self, bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state.done += bytes;

        let now = Instant::now();
        if now.duration_since(state.last_render) < self.interval {
            return;
        }
        state.last_render = now;

        let percent = if state.total == 0 {
            100
        } else {
            state.done.saturating_mul(100) / state.total
        };

        // Throughput since begin(). A long-run average is coarser than a
        // sliding window but never jitters on bursty worker completions.
        let elapsed = now.duration_since(state.started);
        let rate = if elapsed.is_zero() {
            0.0
        } else {
            mib(state.done) / elapsed.as_secs_f64()
        };

        eprint!(
            "\x1b[2K\r{}: {percent}% of {:.1} MiB ({rate:.1} MiB/s)",
            state.name,
            mib(state.total),
        );
    }

    fn finish(&self, name: &str) {
        let state = self.state.lock().unwrap();

        eprintln!("\x1b[2K\r{name}: {:.1} MiB", mib(state.done));
    }
}
