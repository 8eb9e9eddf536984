use crate::{RateLimit, TokenBucket};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Process-wide memoization of token buckets, keyed by
/// (tenant, endpoint class). Concurrent jobs for the same tenant share one
/// bucket; buckets live for the process lifetime.
///
/// Constructed once at startup and injected; tests build a fresh Registry.
#[derive(Default)]
pub struct Registry {
    buckets: Mutex<HashMap<(String, &'static str), Arc<TokenBucket>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the bucket for (tenant, endpoint class), lazily creating it
    /// with `limit` on first use.
    pub fn bucket(
        &self,
        tenant_id: &str,
        endpoint_class: &'static str,
        limit: RateLimit,
    ) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry((tenant_id.to_string(), endpoint_class))
            .or_insert_with(|| Arc::new(TokenBucket::new(limit)))
            .clone()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn buckets_are_shared_per_tenant_and_class() {
        let registry = Registry::new();
        let a = registry.bucket("t1", "gitlab", RateLimit::per_second(5));
        let b = registry.bucket("t1", "gitlab", RateLimit::per_second(5));
        let c = registry.bucket("t2", "gitlab", RateLimit::per_second(5));
        let d = registry.bucket("t1", "fireflies", RateLimit::per_minute(60));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(!Arc::ptr_eq(&a, &d));
    }

    #[test]
    fn first_use_wins_the_limit() {
        let registry = Registry::new();
        let a = registry.bucket("t1", "gitlab", RateLimit::per_second(5));
        // A later caller with a different limit still gets the original bucket.
        let b = registry.bucket("t1", "gitlab", RateLimit::per_second(50));
        assert_eq!(a.limit(), b.limit());
    }
}
