// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Container/runtime identity resolver contract. The concrete lookup
//! (talking to the container runtime's socket, reading cgroup-derived
//! container ids) is an external collaborator; this module only defines
//! what the rest of the agent consumes from it, plus a cache so repeated
//! lookups for the same pid within one cycle don't re-hit the runtime.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub container_name: Option<String>,
    pub pod_name: Option<String>,
    pub namespace: Option<String>,
}

pub trait RuntimeResolver: Send + Sync {
    fn resolve(&self, pid: i32) -> ContainerIdentity;
}

/// Used where no container runtime is configured (bare-metal hosts, local
/// one-shot runs); every lookup returns an empty identity.
pub struct NoopResolver;

impl RuntimeResolver for NoopResolver {
    fn resolve(&self, _pid: i32) -> ContainerIdentity {
        ContainerIdentity::default()
    }
}

/// Wraps any [`RuntimeResolver`] with a per-cycle cache. The cache is
/// flushed between cycles since container composition may change.
pub struct CachingResolver<R: RuntimeResolver> {
    inner: R,
    cache: Mutex<HashMap<i32, ContainerIdentity>>,
}

impl<R: RuntimeResolver> CachingResolver<R> {
    pub fn new(inner: R) -> Self {
        CachingResolver {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn flush(&self) {
        self.cache.lock().unwrap().clear();
    }
}

impl<R: RuntimeResolver> RuntimeResolver for CachingResolver<R> {
    fn resolve(&self, pid: i32) -> ContainerIdentity {
        if let Some(cached) = self.cache.lock().unwrap().get(&pid) {
            return cached.clone();
        }
        let identity = self.inner.resolve(pid);
        self.cache.lock().unwrap().insert(pid, identity.clone());
        identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl RuntimeResolver for CountingResolver {
        fn resolve(&self, _pid: i32) -> ContainerIdentity {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ContainerIdentity {
                container_name: Some("abc123".to_string()),
                ..Default::default()
            }
        }
    }

    #[test]
    fn caching_resolver_hits_inner_once_per_pid() {
        let resolver = CachingResolver::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        resolver.resolve(1);
        resolver.resolve(1);
        resolver.resolve(2);
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_clears_the_cache() {
        let resolver = CachingResolver::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        resolver.resolve(1);
        resolver.flush();
        resolver.resolve(1);
        assert_eq!(resolver.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn noop_resolver_always_returns_empty_identity() {
        let resolver = NoopResolver;
        assert_eq!(resolver.resolve(123), ContainerIdentity::default());
    }
}
