//! Core rate limiter implementation.

use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::Result;
use crate::store::CounterStore;

use super::events::{EventSink, RateLimitEvent};
use super::key::CounterKey;
use super::rules::{RateLimitRule, RateLimitRules, WindowStrategy};

/// A fixed-window rate limiter over a shared counter store.
///
/// The limiter holds no mutable state of its own: rules are fixed at
/// construction and every counter lives in the store, so any number of
/// limiter instances (in any number of processes) pointing at the same store
/// enforce the same limits. It is cheap to share behind an `Arc`.
///
/// # Failure policy
///
/// [`is_allowed`](Self::is_allowed) **fails open**: if the store cannot be
/// reached, the request is admitted and an error event is emitted. The
/// introspection calls ([`get_current_count`](Self::get_current_count),
/// [`get_time_until_reset`](Self::get_time_until_reset),
/// [`reset`](Self::reset), [`status`](Self::status)) return
/// [`RatewardenError::StoreUnavailable`](crate::error::RatewardenError::StoreUnavailable)
/// instead.
pub struct RateLimiter {
    /// Shared counter storage
    store: Arc<dyn CounterStore>,
    /// Optional event sink; events are dropped when absent
    sink: Option<Arc<dyn EventSink>>,
    /// Rules resolved per request type
    rules: RateLimitRules,
}

/// Snapshot of a counter, suitable for `429` responses and
/// `X-RateLimit-*` headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub request_type: String,
    pub identifier: String,
    pub current_count: u64,
    pub max_requests: u64,
    pub window_seconds: u64,
    /// Requests still admitted in the current window
    pub remaining: u64,
    /// Seconds until the window resets, 0 when no window is active
    pub reset_after_seconds: u64,
}

impl RateLimitStatus {
    pub fn is_limited(&self) -> bool {
        self.remaining == 0
    }
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// `rules` are expected to have passed [`RateLimitRules::validate`].
    pub fn new(
        store: Arc<dyn CounterStore>,
        sink: Option<Arc<dyn EventSink>>,
        rules: RateLimitRules,
    ) -> Self {
        Self { store, sink, rules }
    }

    /// Get the configured rules.
    pub fn rules(&self) -> &RateLimitRules {
        &self.rules
    }

    /// Get the rule applied to a request type.
    pub fn limit_for(&self, request_type: &str) -> RateLimitRule {
        self.rules.resolve(request_type)
    }

    /// Derive the store key for a request type and identifier.
    pub fn counter_key(&self, request_type: &str, identifier: &str) -> CounterKey {
        CounterKey::new(&self.rules.key_prefix, request_type, identifier)
    }

    /// Decide whether a request may proceed, counting it if so.
    ///
    /// Returns `false` only when the window quota is used up. Store failures
    /// admit the request (see the failure policy on [`RateLimiter`]), so a
    /// `false` always means "not allowed right now".
    pub async fn is_allowed(&self, request_type: &str, identifier: &str) -> bool {
        let rule = self.limit_for(request_type);
        let key = self.counter_key(request_type, identifier);

        trace!(
            key = %key,
            window_seconds = rule.window_seconds,
            max_requests = rule.max_requests,
            "Checking rate limit"
        );

        let decision = match self.rules.strategy {
            WindowStrategy::CheckThenIncrement => self.check_then_increment(&key, rule).await,
            WindowStrategy::IncrementThenCompare => self.increment_then_compare(&key, rule).await,
        };

        match decision {
            Ok(allowed) => allowed,
            Err(e) => {
                debug!(key = %key, error = %e, "Counter store failed, failing open");
                self.emit(RateLimitEvent::error(
                    request_type,
                    identifier,
                    e.to_string(),
                ));
                true
            }
        }
    }

    async fn check_then_increment(&self, key: &CounterKey, rule: RateLimitRule) -> Result<bool> {
        let current = self
            .store
            .get_and_arm(key.as_str(), rule.window_seconds)
            .await?
            .unwrap_or(0);

        if current >= rule.max_requests {
            debug!(key = %key, count = current, limit = rule.max_requests, "Rate limit exceeded");
            self.emit(RateLimitEvent::exceeded(
                &key.request_type,
                &key.identifier,
                current,
                rule.max_requests,
            ));
            return Ok(false);
        }

        let count = self.increment_and_arm(key, rule).await?;
        self.emit(RateLimitEvent::admitted(
            &key.request_type,
            &key.identifier,
            count,
            rule.max_requests,
        ));
        Ok(true)
    }

    async fn increment_then_compare(&self, key: &CounterKey, rule: RateLimitRule) -> Result<bool> {
        let count = self.increment_and_arm(key, rule).await?;

        if count > rule.max_requests {
            let current = self.store.decrement(key.as_str()).await?;
            debug!(key = %key, count = current, limit = rule.max_requests, "Rate limit exceeded");
            self.emit(RateLimitEvent::exceeded(
                &key.request_type,
                &key.identifier,
                count - 1,
                rule.max_requests,
            ));
            return Ok(false);
        }

        self.emit(RateLimitEvent::admitted(
            &key.request_type,
            &key.identifier,
            count,
            rule.max_requests,
        ));
        Ok(true)
    }

    /// Increment the counter; a counter created by this increment gets its
    /// window armed immediately.
    async fn increment_and_arm(&self, key: &CounterKey, rule: RateLimitRule) -> Result<u64> {
        let count = self.store.increment(key.as_str()).await?;
        if count == 1 {
            trace!(key = %key, window_seconds = rule.window_seconds, "Starting new window");
            self.store
                .set_expiry_if_unset(key.as_str(), rule.window_seconds)
                .await?;
        }
        Ok(count)
    }

    /// Get the number of requests counted in the current window.
    ///
    /// Returns 0 when no window is active.
    pub async fn get_current_count(&self, request_type: &str, identifier: &str) -> Result<u64> {
        let key = self.counter_key(request_type, identifier);
        Ok(self.store.get(key.as_str()).await?.unwrap_or(0))
    }

    /// Get the number of seconds until the current window resets.
    ///
    /// Returns 0 when no window is active (the key is absent or carries no
    /// expiry), meaning the caller is not limited.
    pub async fn get_time_until_reset(&self, request_type: &str, identifier: &str) -> Result<u64> {
        let key = self.counter_key(request_type, identifier);
        Ok(self.store.ttl(key.as_str()).await?.unwrap_or(0))
    }

    /// Discard the counter, returning whether one was active.
    pub async fn reset(&self, request_type: &str, identifier: &str) -> Result<bool> {
        let key = self.counter_key(request_type, identifier);
        let removed = self.store.delete(key.as_str()).await?;
        debug!(key = %key, removed = removed, "Rate limit counter reset");
        Ok(removed)
    }

    /// Get a snapshot of the counter without counting a request.
    pub async fn status(&self, request_type: &str, identifier: &str) -> Result<RateLimitStatus> {
        let rule = self.limit_for(request_type);
        let key = self.counter_key(request_type, identifier);

        let current_count = self.store.get(key.as_str()).await?.unwrap_or(0);
        let reset_after_seconds = self.store.ttl(key.as_str()).await?.unwrap_or(0);

        Ok(RateLimitStatus {
            request_type: request_type.to_string(),
            identifier: identifier.to_string(),
            current_count,
            max_requests: rule.max_requests,
            window_seconds: rule.window_seconds,
            remaining: rule.max_requests.saturating_sub(current_count),
            reset_after_seconds,
        })
    }

    fn emit(&self, event: RateLimitEvent) {
        if let Some(sink) = &self.sink {
            sink.record(event);
        }
    }
}
