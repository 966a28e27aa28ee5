//! Counter key derivation.

/// Separator between the request type and the identifier.
pub const KEY_SEPARATOR: char = ':';

/// A key that uniquely identifies one counter in the shared store.
///
/// Rendered as `{prefix}{request_type}:{identifier}`. Identifiers are opaque
/// and may contain `:`; configured request types may not (see
/// [`RateLimitRules::validate`](super::RateLimitRules::validate)), so the
/// first separator after the prefix always ends the request type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CounterKey {
    /// The request type (e.g. `api`, `login`)
    pub request_type: String,
    /// The caller identity (e.g. IP address, user ID)
    pub identifier: String,
    rendered: String,
}

impl CounterKey {
    /// Create a new counter key under `prefix`.
    pub fn new(prefix: &str, request_type: &str, identifier: &str) -> Self {
        let mut rendered =
            String::with_capacity(prefix.len() + request_type.len() + identifier.len() + 1);
        rendered.push_str(prefix);
        rendered.push_str(request_type);
        rendered.push(KEY_SEPARATOR);
        rendered.push_str(identifier);

        Self {
            request_type: request_type.to_string(),
            identifier: identifier.to_string(),
            rendered,
        }
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.rendered
    }
}

impl std::fmt::Display for CounterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.rendered)
    }
}

impl AsRef<str> for CounterKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_key_format() {
        let key = CounterKey::new("ratelimit:", "api", "u1");
        assert_eq!(key.as_str(), "ratelimit:api:u1");
        assert_eq!(key.to_string(), "ratelimit:api:u1");
        assert_eq!(key.request_type, "api");
        assert_eq!(key.identifier, "u1");
    }

    #[test]
    fn test_empty_parts_are_literal() {
        let key = CounterKey::new("ratelimit:", "", "");
        assert_eq!(key.as_str(), "ratelimit::");
    }

    #[test]
    fn test_distinct_pairs_distinct_keys() {
        let a = CounterKey::new("ratelimit:", "api", "10.0.0.1");
        let b = CounterKey::new("ratelimit:", "login", "10.0.0.1");
        let c = CounterKey::new("ratelimit:", "api", "10.0.0.2");

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(a.as_str(), b.as_str());
        assert_ne!(a.as_str(), c.as_str());
    }

    #[test]
    fn test_identifier_may_contain_separator() {
        // IPv6 identifiers carry colons; the request type is still recoverable
        // because request types do not.
        let key = CounterKey::new("ratelimit:", "api", "::1");
        assert_eq!(key.as_str(), "ratelimit:api:::1");
        assert_ne!(key, CounterKey::new("ratelimit:", "api", ":1"));
    }

    #[test]
    fn test_prefix_namespaces_keys() {
        let a = CounterKey::new("ratelimit:", "api", "u1");
        let b = CounterKey::new("staging:", "api", "u1");
        assert_ne!(a.as_str(), b.as_str());
    }
}
