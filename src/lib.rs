//! Windgate - Request Admission Control
//!
//! This crate decides, per client and per time window, whether an inbound
//! request may proceed. Window state lives behind the [`ratelimit::WindowStore`]
//! trait, with an in-process implementation for single instances and a
//! Redis-backed one for deployments that share a quota across instances.
//! The [`http::RateLimitLayer`] wraps any axum/tower service.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
