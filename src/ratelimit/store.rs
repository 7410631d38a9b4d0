//! Window store trait for abstracting in-process and shared implementations.

use async_trait::async_trait;

use super::window::{Window, WindowState};
use crate::error::Result;

/// Where per-key window records live.
///
/// `record` must be a single atomic step: stale entries are dropped, the
/// attempt is counted and the resulting count is returned, with no window in
/// which a concurrent caller for the same key can observe the pre-increment
/// value. Implementations must not serialize unrelated keys.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Register one attempt for `key` at `now_ms` and return the count after it.
    async fn record(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState>;

    /// Read the state of `key` at `now_ms` without counting anything.
    async fn peek(&self, key: &str, now_ms: u64, window: &Window) -> Result<WindowState>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}
