//! Rate limiting logic.

mod events;
mod key;
mod limiter;
mod rules;

pub use events::{EventKind, EventSink, RateLimitEvent, TracingSink};
pub use key::{CounterKey, KEY_SEPARATOR};
pub use limiter::{RateLimitStatus, RateLimiter};
pub use rules::{
    RateLimitRule, RateLimitRules, WindowStrategy, DEFAULT_KEY_PREFIX, DEFAULT_MAX_REQUESTS,
    DEFAULT_WINDOW_SECONDS, MAX_WINDOW_SECONDS,
};
