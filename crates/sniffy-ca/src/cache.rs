//! Bounded leaf certificate cache with per-subject request coalescing.
//!
//! Lookups, inserts and evictions happen under one mutex. Issuance itself
//! runs outside it, so different subjects are signed in parallel while
//! concurrent misses on the same subject share a single in-flight result.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use lru::LruCache;
use tracing::{debug, warn};

use crate::error::{CaError, CryptoError};
use crate::issuer::IssueLeaf;

type FlightResult<V> = Result<Arc<V>, CryptoError>;

/// One pending issuance. Every caller that finds it attaches to the same
/// once-cell, so the issuer runs at most once per flight.
struct Flight<V> {
    result: OnceLock<FlightResult<V>>,
}

struct CacheState<V> {
    entries: LruCache<String, Arc<V>>,
    in_flight: HashMap<String, Arc<Flight<V>>>,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that waited on another caller's in-flight issuance.
    pub coalesced: u64,
    pub issued: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Subject-keyed LRU cache in front of an issuer.
pub struct CertificateCache<I: IssueLeaf> {
    issuer: I,
    state: Mutex<CacheState<I::Output>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    issued: AtomicU64,
    evictions: AtomicU64,
}

impl<I: IssueLeaf> CertificateCache<I> {
    pub fn new(issuer: I, capacity: NonZeroUsize) -> Self {
        Self {
            issuer,
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
            issued: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn issuer(&self) -> &I {
        &self.issuer
    }

    /// Return the cached value for `subject`, issuing it on a miss.
    ///
    /// A hit returns the same `Arc` as the call that populated the entry.
    /// Concurrent misses on one subject invoke the issuer once and all
    /// receive its result, error included. Errors are not cached.
    pub fn get_or_issue(&self, subject: &str) -> Result<Arc<I::Output>, CaError> {
        let (flight, leader) = {
            let mut state = self.lock();
            if let Some(hit) = state.entries.get(subject) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(subject = %subject, "leaf cache hit");
                return Ok(Arc::clone(hit));
            }

            if let Some(flight) = state.in_flight.get(subject) {
                self.coalesced.fetch_add(1, Ordering::Relaxed);
                debug!(subject = %subject, "waiting on in-flight issuance");
                (Arc::clone(flight), false)
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let flight = Arc::new(Flight {
                    result: OnceLock::new(),
                });
                state
                    .in_flight
                    .insert(subject.to_string(), Arc::clone(&flight));
                (flight, true)
            }
        };

        let guard = leader.then(|| FlightGuard {
            cache: self,
            subject,
            finished: false,
        });
        let result = flight
            .result
            .get_or_init(|| self.issuer.issue(subject).map(Arc::new))
            .clone();

        if let Some(guard) = guard {
            guard.finish(&result);
        }
        result.map_err(CaError::from)
    }

    /// Publish a finished flight: drop the in-flight marker and, on
    /// success, insert the value as most recently used.
    fn complete(&self, subject: &str, result: &FlightResult<I::Output>) {
        let mut state = self.lock();
        state.in_flight.remove(subject);

        match result {
            Ok(value) => {
                self.issued.fetch_add(1, Ordering::Relaxed);
                let displaced = state.entries.push(subject.to_string(), Arc::clone(value));
                if let Some((evicted, _)) = displaced {
                    if evicted != subject {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                        debug!(subject = %evicted, "evicted least recently used leaf");
                    }
                }
            }
            Err(e) => warn!(subject = %subject, error = %e, "leaf issuance failed"),
        }
    }

    /// Whether `subject` is cached. Does not count as a use.
    pub fn contains(&self, subject: &str) -> bool {
        self.lock().entries.contains(subject)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.lock().entries.cap()
    }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity) = {
            let state = self.lock();
            (state.entries.len(), state.entries.cap().get())
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            issued: self.issued.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<I::Output>> {
        // Every mutation completes before the guard drops, so a poisoned
        // state is still consistent.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Held by the caller leading a flight. If the issuer unwinds before the
/// flight is published, dropping the guard clears the in-flight marker so
/// the next request for the subject starts over.
struct FlightGuard<'a, I: IssueLeaf> {
    cache: &'a CertificateCache<I>,
    subject: &'a str,
    finished: bool,
}

impl<I: IssueLeaf> FlightGuard<'_, I> {
    fn finish(mut self, result: &FlightResult<I::Output>) {
        self.cache.complete(self.subject, result);
        self.finished = true;
    }
}

impl<I: IssueLeaf> Drop for FlightGuard<'_, I> {
    fn drop(&mut self) {
        if !self.finished {
            self.cache.lock().in_flight.remove(self.subject);
            warn!(subject = %self.subject, "leaf issuance aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// Issues `"<subject>#<n>"` where n counts calls, optionally slowly or
    /// failing.
    #[derive(Default)]
    struct CountingIssuer {
        calls: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
        panic_next: AtomicBool,
    }

    impl CountingIssuer {
        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl IssueLeaf for CountingIssuer {
        type Output = String;

        fn issue(&self, subject: &str) -> Result<String, CryptoError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.panic_next.swap(false, Ordering::SeqCst) {
                panic!("signer crashed");
            }
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(CryptoError::new("entropy exhausted"));
            }
            Ok(format!("{subject}#{n}"))
        }
    }

    fn cache(capacity: usize, issuer: CountingIssuer) -> CertificateCache<CountingIssuer> {
        CertificateCache::new(issuer, NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn hit_returns_identical_arc() {
        let cache = cache(8, CountingIssuer::default());
        let first = cache.get_or_issue("example.com").unwrap();
        let second = cache.get_or_issue("example.com").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.issuer().calls(), 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.issued, 1);
    }

    #[test]
    fn concurrent_misses_issue_once() {
        let cache = Arc::new(cache(8, CountingIssuer::slow(Duration::from_millis(100))));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_issue("same.example.com").unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(cache.issuer().calls(), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits + stats.coalesced, 15);
    }

    #[test]
    fn distinct_subjects_issue_in_parallel() {
        let cache = Arc::new(cache(8, CountingIssuer::slow(Duration::from_millis(200))));
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_issue(&format!("host-{i}.example.com")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.issuer().calls(), 4);
        assert!(cache.issuer().max_active.load(Ordering::SeqCst) > 1);
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache = cache(2, CountingIssuer::default());
        let a = cache.get_or_issue("a.example.com").unwrap();
        cache.get_or_issue("b.example.com").unwrap();
        cache.get_or_issue("c.example.com").unwrap();

        assert!(!cache.contains("a.example.com"));
        assert!(cache.contains("b.example.com"));
        assert!(cache.contains("c.example.com"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().evictions, 1);

        let a_again = cache.get_or_issue("a.example.com").unwrap();
        assert_ne!(a, a_again);
        assert!(!cache.contains("b.example.com"));
    }

    #[test]
    fn hit_refreshes_recency() {
        let cache = cache(2, CountingIssuer::default());
        cache.get_or_issue("a.example.com").unwrap();
        cache.get_or_issue("b.example.com").unwrap();
        cache.get_or_issue("a.example.com").unwrap();
        cache.get_or_issue("c.example.com").unwrap();

        assert!(cache.contains("a.example.com"));
        assert!(!cache.contains("b.example.com"));
        assert!(cache.contains("c.example.com"));
    }

    #[test]
    fn failures_are_shared_but_not_cached() {
        let issuer = CountingIssuer::slow(Duration::from_millis(100));
        issuer.fail.store(true, Ordering::SeqCst);
        let cache = Arc::new(cache(8, issuer));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.get_or_issue("flaky.example.com")
                })
            })
            .collect();
        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, CaError::Crypto(ref e) if e.message() == "entropy exhausted"));
        }
        assert_eq!(cache.issuer().calls(), 1);
        assert!(cache.is_empty());

        cache.issuer().fail.store(false, Ordering::SeqCst);
        let value = cache.get_or_issue("flaky.example.com").unwrap();
        assert_eq!(value.as_str(), "flaky.example.com#2");
        assert!(cache.contains("flaky.example.com"));
    }

    #[test]
    fn panicking_issuer_does_not_strand_subject() {
        let cache = cache(8, CountingIssuer::default());
        cache.issuer().panic_next.store(true, Ordering::SeqCst);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            cache.get_or_issue("crash.example.com")
        }));
        assert!(outcome.is_err());
        assert!(cache.is_empty());

        let value = cache.get_or_issue("crash.example.com").unwrap();
        assert_eq!(value.as_str(), "crash.example.com#2");
        assert!(cache.contains("crash.example.com"));

        let stats = cache.stats();
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.coalesced, 0);
    }
}
