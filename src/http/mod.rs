//! HTTP middleware adapter and demo server.

mod layer;
mod server;

pub use layer::{
    insert_quota_headers, too_many_requests, RateLimitLayer, RateLimitService, LIMIT_HEADER,
    REMAINING_HEADER, RESET_HEADER, RETRY_AFTER_HEADER,
};
pub use server::{AppState, HttpServer};
