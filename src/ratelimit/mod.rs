//! Rate limiting logic and window state management.

mod clock;
mod distributed;
mod key;
mod limiter;
mod memory;
mod store;
mod window;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use distributed::{RedisStore, DEFAULT_KEY_PREFIX};
pub use key::{ApiKeyExtractor, ClientKey, KeyExtractor, PeerIpExtractor, FALLBACK_KEY};
pub use limiter::{AdmitDecision, FailurePolicy, LimiterConfig, RateLimiter};
pub use memory::{InMemoryStore, DEFAULT_GRACE};
pub use store::WindowStore;
pub use window::{Window, WindowAlgorithm, WindowRecord, WindowState, MAX_WINDOW};
