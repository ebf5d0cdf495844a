//! Stale-response guards for async fetches.
//!
//! Every trigger issues a new token; a response is applied only if its token
//! is still the newest one for the same resource. Late responses are dropped
//! without surfacing anything.

use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FenceToken(u64);

#[derive(Debug, Clone, Default)]
pub struct RequestFence {
    current: u64,
}

impl RequestFence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> FenceToken {
        self.current = self.current.saturating_add(1);
        FenceToken(self.current)
    }

    #[must_use]
    pub fn is_current(&self, token: FenceToken) -> bool {
        token.0 == self.current
    }

    /// Hands the value back only when the token is still current.
    pub fn admit<T>(&self, token: FenceToken, value: T) -> Option<T> {
        self.is_current(token).then_some(value)
    }

    /// Invalidates whatever is in flight without starting a new request.
    pub fn invalidate(&mut self) {
        self.issue();
    }
}

/// Independent fences per resource key.
#[derive(Debug, Clone)]
pub struct KeyedFence<K> {
    fences: HashMap<K, RequestFence>,
}

impl<K> Default for KeyedFence<K> {
    fn default() -> Self {
        Self {
            fences: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash> KeyedFence<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self, key: K) -> FenceToken {
        self.fences.entry(key).or_default().issue()
    }

    #[must_use]
    pub fn is_current(&self, key: &K, token: FenceToken) -> bool {
        self.fences
            .get(key)
            .is_some_and(|fence| fence.is_current(token))
    }

    pub fn admit<T>(&self, key: &K, token: FenceToken, value: T) -> Option<T> {
        self.is_current(key, token).then_some(value)
    }
    /// Drops the fence for a resource that no longer exists. Anything still
    /// in flight for it is treated as superseded.
    pub fn forget(&mut self, key: &K) {
        self.fences.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fences.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fences.is_empty()
    }
}
