//! Ratewarden - Distributed Fixed-Window Rate Limiting
//!
//! This crate gates requests per (request type, identifier) pair using a
//! fixed-window counter held in a shared counter store. Every process that
//! points at the same store enforces the same limits; the limiter itself
//! keeps no mutable state.
//!
//! Store failures during [`RateLimiter::is_allowed`] **fail open**: the
//! request is admitted and an error event is emitted.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use error::{RatewardenError, Result};
pub use ratelimit::{EventSink, RateLimitRule, RateLimitRules, RateLimiter, TracingSink};
pub use store::{CounterStore, MemoryStore};
