//! Window parameters and the per-key window record.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Longest window a limiter accepts.
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// How attempts are counted within a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    /// Count attempts in the span ending now.
    #[default]
    SlidingLog,
    /// Count attempts since the last epoch-aligned boundary.
    ///
    /// Cheaper, but allows up to twice the limit across a boundary.
    FixedWindow,
}

impl std::fmt::Display for WindowAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindowAlgorithm::SlidingLog => write!(f, "sliding_log"),
            WindowAlgorithm::FixedWindow => write!(f, "fixed_window"),
        }
    }
}

/// Parameters a store needs to account one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Window length in milliseconds.
    pub duration_ms: u64,
    /// Number of attempts admitted per window. Bounds the sliding log.
    pub capacity: u64,
    /// Counting scheme.
    pub algorithm: WindowAlgorithm,
}

impl Window {
    /// Create window parameters.
    pub fn new(duration: Duration, capacity: u64, algorithm: WindowAlgorithm) -> Self {
        Self {
            duration_ms: whole_millis(duration),
            capacity,
            algorithm,
        }
    }

    /// The window length.
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Start of the fixed window containing `now_ms`.
    pub fn fixed_start(&self, now_ms: u64) -> u64 {
        if self.duration_ms == 0 {
            return now_ms;
        }
        now_ms - now_ms % self.duration_ms
    }

    /// Entries kept in a sliding log. Never zero so an overflow stays visible.
    pub(crate) fn log_cap(&self) -> usize {
        self.capacity.max(1) as usize
    }
}

/// The result of recording or peeking a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Attempts counted in the current window.
    pub count: u64,
    /// Oldest counted entry (sliding log) or start of the fixed window.
    pub window_start_ms: u64,
}

impl WindowState {
    /// When the oldest counted entry stops counting.
    pub fn reset_at_ms(&self, window: &Window) -> u64 {
        self.window_start_ms.saturating_add(window.duration_ms)
    }
}

/// Per-key accounting state held by the in-process store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowRecord {
    /// Timestamps of counted attempts, oldest first.
    Log(VecDeque<u64>),
    /// Attempts since `window_start_ms`.
    Counter { count: u64, window_start_ms: u64 },
}

impl WindowRecord {
    /// An empty record for the given scheme.
    pub fn new(window: &Window) -> Self {
        match window.algorithm {
            WindowAlgorithm::SlidingLog => WindowRecord::Log(VecDeque::new()),
            WindowAlgorithm::FixedWindow => WindowRecord::Counter {
                count: 0,
                window_start_ms: 0,
            },
        }
    }

    fn matches(&self, algorithm: WindowAlgorithm) -> bool {
        matches!(
            (self, algorithm),
            (WindowRecord::Log(_), WindowAlgorithm::SlidingLog)
                | (WindowRecord::Counter { .. }, WindowAlgorithm::FixedWindow)
        )
    }

    /// Count one attempt at `now_ms`, dropping stale entries first.
    ///
    /// The sliding log keeps at most `capacity` timestamps; the returned
    /// count is taken before trimming, so it saturates at `capacity + 1`.
    pub fn record(&mut self, now_ms: u64, window: &Window) -> WindowState {
        if !self.matches(window.algorithm) {
            *self = WindowRecord::new(window);
        }

        match self {
            WindowRecord::Log(log) => {
                prune(log, now_ms, window.duration_ms);
                log.push_back(now_ms);
                let count = log.len() as u64;
                while log.len() > window.log_cap() {
                    log.pop_front();
                }
                WindowState {
                    count,
                    window_start_ms: log.front().copied().unwrap_or(now_ms),
                }
            }
            WindowRecord::Counter {
                count,
                window_start_ms,
            } => {
                let current = window.fixed_start(now_ms);
                if *window_start_ms != current {
                    *count = 0;
                    *window_start_ms = current;
                }
                *count += 1;
                WindowState {
                    count: *count,
                    window_start_ms: current,
                }
            }
        }
    }

    /// Current state at `now_ms` without changing anything.
    pub fn peek(&self, now_ms: u64, window: &Window) -> WindowState {
        match self {
            WindowRecord::Log(log) if window.algorithm == WindowAlgorithm::SlidingLog => {
                let mut live = log
                    .iter()
                    .copied()
                    .filter(|ts| ts.saturating_add(window.duration_ms) > now_ms);
                let first = live.next();
                WindowState {
                    count: first.map_or(0, |_| 1 + live.count() as u64),
                    window_start_ms: first.unwrap_or(now_ms),
                }
            }
            WindowRecord::Counter {
                count,
                window_start_ms,
            } if window.algorithm == WindowAlgorithm::FixedWindow => {
                let current = window.fixed_start(now_ms);
                WindowState {
                    count: if *window_start_ms == current { *count } else { 0 },
                    window_start_ms: current,
                }
            }
            _ => WindowRecord::new(window).peek(now_ms, window),
        }
    }

    /// Number of timestamps or counters held.
    pub fn len(&self) -> usize {
        match self {
            WindowRecord::Log(log) => log.len(),
            WindowRecord::Counter { count, .. } => *count as usize,
        }
    }

    /// Whether nothing is being counted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `duration` in milliseconds, saturating at `u64::MAX`.
pub(crate) fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn prune(log: &mut VecDeque<u64>, now_ms: u64, duration_ms: u64) {
    while let Some(&oldest) = log.front() {
        if oldest.saturating_add(duration_ms) > now_ms {
            break;
        }
        log.pop_front();
    }
}
