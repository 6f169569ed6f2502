use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use moka::sync::Cache;
use tokio::sync::Notify;
use zeroize::Zeroize;

use crate::error::{CoreError, CoreResult};
use crate::model::Keyset;

/// Owns decoded private-key bytes exclusively; wipes them on drop so an
/// evicted or explicitly-deleted cache entry never lingers in memory (spec
/// §9 "ownership of cached private keys").
pub struct ZeroizingKeyset(pub Keyset);

impl Drop for ZeroizingKeyset {
    fn drop(&mut self) {
        self.0.signing_private.zeroize();
        self.0.encr_private.zeroize();
    }
}

/// In-process TTL cache for keysets plus the thundering-herd in-flight
/// table used by [`crate::keymanager::thundering_herd`] (spec §4.B).
pub struct PrivateKeyCache {
    cache: Cache<String, Arc<ZeroizingKeyset>>,
    in_flight: Mutex<HashMap<String, Arc<InFlightEntry>>>,
}

struct InFlightEntry {
    notify: Notify,
    result: Mutex<Option<CoreResult<Keyset>>>,
}

impl PrivateKeyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: Cache::builder().time_to_live(ttl).build(),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, secret_id: &str) -> Option<Keyset> {
        self.cache.get(secret_id).map(|v| v.0.clone())
    }

    pub fn insert(&self, secret_id: &str, keyset: Keyset) {
        self.cache
            .insert(secret_id.to_string(), Arc::new(ZeroizingKeyset(keyset)));
    }

    /// Removes the cache entry, wiping its private bytes first (the `Drop`
    /// impl on `ZeroizingKeyset` does the wipe once the last `Arc` reference
    /// is dropped, which happens here since `invalidate` drops the cache's
    /// own reference).
    pub fn remove(&self, secret_id: &str) {
        self.cache.invalidate(secret_id);
    }

    /// Wipes every residual entry (spec §4.B `Close`).
    pub fn clear_all(&self) {
        self.cache.invalidate_all();
        // `invalidate_all` is lazily applied by moka's maintenance cycle;
        // force it so `Close` leaves no recoverable entries.
        self.cache.run_pending_tasks();
    }

    /// Runs `f` under the thundering-herd protocol for `secret_id`: the
    /// first caller for a missing key becomes the leader and executes `f`;
    /// concurrent callers for the same key block on the leader's result
    /// instead of re-issuing the fetch (spec §4.B, §8 thundering-herd
    /// invariant).
    pub async fn get_or_fetch<F, Fut>(&self, secret_id: &str, f: F) -> CoreResult<Keyset>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = CoreResult<Keyset>>,
    {
        if let Some(ks) = self.get(secret_id) {
            return Ok(ks);
        }

        let (entry, is_leader) = {
            let mut table = self.in_flight.lock().unwrap();
            if let Some(existing) = table.get(secret_id) {
                (existing.clone(), false)
            } else {
                let entry = Arc::new(InFlightEntry {
                    notify: Notify::new(),
                    result: Mutex::new(None),
                });
                table.insert(secret_id.to_string(), entry.clone());
                (entry, true)
            }
        };

        if !is_leader {
            // Follower: wait for the leader's completion signal. If the
            // leader already finished and removed the entry between our
            // table lookup and here, the result slot is already populated
            // and `notified()` — per spec §9's open question — must not be
            // awaited first, since the signal was already fired; reading
            // the slot unconditionally here, then notified() only if empty,
            // avoids that race.
            loop {
                if let Some(result) = entry.result.lock().unwrap().clone() {
                    return result;
                }
                entry.notify.notified().await;
            }
        }

        // Leader path.
        let result = f().await;

        if let Ok(ks) = &result {
            self.insert(secret_id, ks.clone());
        }

        *entry.result.lock().unwrap() = Some(result.clone());
        // Close the signal before removing the entry (spec §9 open
        // question): notify_waiters wakes every follower currently parked
        // on `notified()`, and any follower arriving after this point but
        // before the `remove` below still observes the populated result
        // slot directly.
        entry.notify.notify_waiters();
        self.in_flight.lock().unwrap().remove(secret_id);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    fn sample_keyset() -> Keyset {
        Keyset {
            unique_key_id: "k1".into(),
            signing_private: "sp".into(),
            signing_public: "SP".into(),
            encr_private: "ep".into(),
            encr_public: "EP".into(),
        }
    }

    #[test]
    fn insert_then_get_round_trips() {
        let cache = PrivateKeyCache::new(Duration::from_secs(60));
        cache.insert("k1", sample_keyset());
        let got = cache.get("k1").unwrap();
        assert_eq!(got.unique_key_id, "k1");
    }

    #[test]
    fn remove_clears_entry() {
        let cache = PrivateKeyCache::new(Duration::from_secs(60));
        cache.insert("k1", sample_keyset());
        cache.remove("k1");
        assert!(cache.get("k1").is_none());
    }

    #[tokio::test]
    async fn concurrent_get_or_fetch_calls_fetcher_exactly_once() {
        let cache = StdArc::new(PrivateKeyCache::new(Duration::from_secs(60)));
        let calls = StdArc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("k9", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(sample_keyset())
                        }
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap().unwrap());
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|ks| ks.unique_key_id == "k1"));
    }

    #[tokio::test]
    async fn distinct_keys_proceed_independently() {
        let cache = StdArc::new(PrivateKeyCache::new(Duration::from_secs(60)));
        let calls = StdArc::new(AtomicUsize::new(0));

        let c1 = cache.clone();
        let calls1 = calls.clone();
        let t1 = tokio::spawn(async move {
            c1.get_or_fetch("k1", || {
                let calls = calls1.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_keyset())
                }
            })
            .await
        });

        let c2 = cache.clone();
        let calls2 = calls.clone();
        let t2 = tokio::spawn(async move {
            c2.get_or_fetch("k2", || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(sample_keyset())
                }
            })
            .await
        });

        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
