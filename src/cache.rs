use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{CallError, SnapshotError};
use crate::hash::Fingerprint;
use crate::state::{Dynamic, Value};

/// A call about to be issued: the fingerprint key plus the closure that
/// actually performs the call.
///
/// The key must capture **every** semantically relevant input of the call
/// (URL, method, headers and body for a fetch; system, prompt, schema, model
/// and tools for a generation). An input left out of the key is a
/// correctness hazard: logically different calls would share a cache entry.
///
/// `exec` owns its own timeout and retry policy and must eventually settle.
pub struct CallRequest<R> {
    pub(crate) key: serde_json::Result<serde_json::Value>,
    pub(crate) exec: Box<dyn FnOnce() -> anyhow::Result<R> + Send>,
}

impl<R: Send + Sync + 'static> CallRequest<R> {
    pub fn new<K, F>(key: K, exec: F) -> Self
    where
        K: Serialize,
        F: FnOnce() -> anyhow::Result<R> + Send + 'static,
    {
        Self {
            key: serde_json::to_value(key),
            exec: Box::new(exec),
        }
    }
}

/// A single memoized call result, keyed by fingerprint and shared by every
/// node that computed that fingerprint.
///
/// The entry settles exactly once: `Pending` becomes `Ready` or `Failed`
/// and then never changes again. A `Failed` entry is terminal; retrying a
/// call requires perturbing its inputs so that a new fingerprint (and a new
/// entry) is produced.
pub struct CacheEntry {
    fingerprint: Fingerprint,
    state: Mutex<Value>,
    subscribers: AtomicUsize,
}

impl CacheEntry {
    fn pending(fingerprint: Fingerprint) -> Self {
        Self {
            fingerprint,
            state: Mutex::new(Value::Pending),
            subscribers: AtomicUsize::new(0),
        }
    }

    fn settled(fingerprint: Fingerprint, value: Value) -> Self {
        Self {
            fingerprint,
            state: Mutex::new(value),
            subscribers: AtomicUsize::new(0),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Number of nodes currently observing this entry.
    pub fn subscribers(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub(crate) fn subscribe(&self) {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn unsubscribe(&self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn state(&self) -> Value {
        self.state.lock().unwrap().clone()
    }

    /// Settles the entry, keeping the state monotonic. A result arriving for
    /// an already settled entry is a stale in-flight call for a superseded
    /// fingerprint and is discarded.
    pub(crate) fn settle(&self, result: Result<Dynamic, CallError>) {
        let mut state = self.state.lock().unwrap();

        if !matches!(*state, Value::Pending) {
            tracing::debug!(
                fingerprint = %self.fingerprint.to_hex(),
                "discarding stale settlement for an already settled entry",
            );
            return;
        }

        *state = match result {
            Ok(value) => Value::Ready(value),
            Err(error) => Value::Failed(error),
        };
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "CacheEntry({}, {:?})",
            self.fingerprint.to_hex(),
            self.state.lock().unwrap()
        )
    }
}

/// The shared `fingerprint -> entry` map behind every call node.
///
/// The store guarantees singleflight semantics: at most one outstanding
/// execution per distinct fingerprint, no matter how many graph positions
/// (or engines) request it. Entries are created lazily on first request and
/// live for the lifetime of the store; nothing is evicted.
///
/// A store is an explicit, injectable object rather than a process-wide
/// singleton, so tests and independent pattern instances can either share
/// one or keep isolated caches.
#[derive(Clone, Default)]
pub struct CacheStore {
    entries: Arc<Mutex<HashMap<Fingerprint, Arc<CacheEntry>>>>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `fingerprint`, creating it and spawning `exec`
    /// on the rayon pool if it does not exist yet. The returned entry may be
    /// pending or already settled; the caller never blocks on it. The flag
    /// is true when this request actually spawned the execution — only then
    /// will `done` hear about the settlement.
    ///
    /// When the spawned execution settles, `fingerprint` is sent over `done`
    /// so the owning scheduler can revisit the subscribed nodes.
    pub(crate) fn request(
        &self,
        fingerprint: Fingerprint,
        exec: Box<dyn FnOnce() -> anyhow::Result<Dynamic> + Send>,
        done: Sender<Fingerprint>,
    ) -> (Arc<CacheEntry>, bool) {
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get(&fingerprint) {
            tracing::debug!(fingerprint = %fingerprint.to_hex(), "cache hit");
            return (entry.clone(), false);
        }

        tracing::debug!(fingerprint = %fingerprint.to_hex(), "cache miss, spawning call");

        let entry = Arc::new(CacheEntry::pending(fingerprint));
        entries.insert(fingerprint, entry.clone());
        drop(entries);

        let worker = entry.clone();
        rayon::spawn(move || {
            let result = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(exec)) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(error)) => Err(CallError::from(error)),
                Err(panic) => {
                    let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                        format!("Call panicked: {s}")
                    } else if let Some(s) = panic.downcast_ref::<String>() {
                        format!("Call panicked: {s}")
                    } else {
                        String::from("Call panicked with unknown payload")
                    };

                    Err(CallError::new(anyhow::anyhow!(msg)))
                }
            };

            worker.settle(result);

            // The receiver may be gone if the engine was dropped mid-flight.
            let _ = done.send(fingerprint);
        });

        (entry, true)
    }

    pub fn get(&self, fingerprint: Fingerprint) -> Option<Arc<CacheEntry>> {
        self.entries.lock().unwrap().get(&fingerprint).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    /// Writes every settled `Ready` entry whose payload is a
    /// `serde_json::Value` (the wire type of HTTP and LLM results) as a
    /// CBOR document, so a later process can warm its cache with
    /// [`restore`](Self::restore).
    ///
    /// Pending and failed entries are skipped: a pending call will be
    /// re-issued on the next run and a failure is only terminal within a
    /// process lifetime.
    pub fn snapshot<W: io::Write>(&self, writer: W) -> Result<(), SnapshotError> {
        let entries = self.entries.lock().unwrap();

        let settled: Vec<(String, serde_json::Value)> = entries
            .iter()
            .filter_map(|(fingerprint, entry)| match entry.state() {
                Value::Ready(value) => value
                    .downcast_ref::<serde_json::Value>()
                    .map(|json| (fingerprint.to_hex(), json.clone())),
                _ => None,
            })
            .collect();

        ciborium::into_writer(&settled, writer)?;
        Ok(())
    }

    /// Restores entries written by [`snapshot`](Self::snapshot). Existing
    /// entries win over restored ones.
    pub fn restore<R: io::Read>(&self, reader: R) -> Result<usize, SnapshotError> {
        let settled: Vec<(String, serde_json::Value)> = ciborium::from_reader(reader)?;
        let mut entries = self.entries.lock().unwrap();
        let mut restored = 0;

        for (hex, json) in settled {
            let Some(fingerprint) = Fingerprint::from_hex(&hex) else {
                continue;
            };

            entries.entry(fingerprint).or_insert_with(|| {
                restored += 1;
                Arc::new(CacheEntry::settled(fingerprint, Value::ready(json)))
            });
        }

        tracing::debug!(restored, "restored cache snapshot");
        Ok(restored)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::channel;

    use serde_json::json;

    fn erased(
        exec: impl FnOnce() -> anyhow::Result<serde_json::Value> + Send + 'static,
    ) -> Box<dyn FnOnce() -> anyhow::Result<Dynamic> + Send> {
        Box::new(move || exec().map(|v| Arc::new(v) as Dynamic))
    }

    #[test]
    fn singleflight_per_fingerprint() {
        let store = CacheStore::new();
        let (tx, rx) = channel();
        let fingerprint = Fingerprint::of_key(&json!({"call": "x"}));
        let calls = Arc::new(AtomicUsize::new(0));

        let (a, spawned_a) = {
            let calls = calls.clone();
            store.request(
                fingerprint,
                erased(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("result"))
                }),
                tx.clone(),
            )
        };
        let (b, spawned_b) = {
            let calls = calls.clone();
            store.request(
                fingerprint,
                erased(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("result"))
                }),
                tx,
            )
        };

        assert!(spawned_a);
        assert!(!spawned_b);
        assert!(Arc::ptr_eq(&a, &b));

        // Exactly one settlement notification for the one spawned call.
        assert_eq!(rx.recv().unwrap(), fingerprint);
        assert!(rx.try_recv().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(a.state(), Value::Ready(_)));
    }

    #[test]
    fn failure_is_terminal_for_a_fingerprint() {
        let store = CacheStore::new();
        let (tx, rx) = channel();
        let fingerprint = Fingerprint::of_key(&json!({"call": "failing"}));

        let (entry, _) = store.request(
            fingerprint,
            erased(|| Err(anyhow::anyhow!("network down"))),
            tx.clone(),
        );
        rx.recv().unwrap();
        assert!(matches!(entry.state(), Value::Failed(_)));

        // Identical inputs do not re-run the call.
        let calls = Arc::new(AtomicUsize::new(0));
        let (again, spawned) = {
            let calls = calls.clone();
            store.request(
                fingerprint,
                erased(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("never"))
                }),
                tx,
            )
        };
        assert!(!spawned);
        assert!(Arc::ptr_eq(&entry, &again));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn panicking_call_settles_as_failed() {
        let store = CacheStore::new();
        let (tx, rx) = channel();
        let fingerprint = Fingerprint::of_key(&json!({"call": "panic"}));

        let (entry, _) = store.request(fingerprint, Box::new(|| panic!("exec bug")), tx);
        rx.recv().unwrap();

        match entry.state() {
            Value::Failed(error) => assert!(error.to_string().contains("exec bug")),
            _ => panic!("expected a failed entry"),
        }
    }

    #[test]
    fn stale_settlement_is_discarded() {
        let fingerprint = Fingerprint::of_key(&json!({"call": "stale"}));
        let entry = CacheEntry::settled(fingerprint, Value::ready(json!("fresh")));

        entry.settle(Ok(Arc::new(json!("stale")) as Dynamic));

        match entry.state() {
            Value::Ready(value) => {
                assert_eq!(value.downcast_ref::<serde_json::Value>(), Some(&json!("fresh")));
            }
            _ => panic!("expected the original settled value"),
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let store = CacheStore::new();
        let (tx, rx) = channel();
        let fp_ok = Fingerprint::of_key(&json!({"call": "ok"}));
        let fp_err = Fingerprint::of_key(&json!({"call": "err"}));

        store.request(fp_ok, erased(|| Ok(json!({"status": 200}))), tx.clone());
        store.request(fp_err, erased(|| Err(anyhow::anyhow!("no"))), tx.clone());
        rx.recv().unwrap();
        rx.recv().unwrap();

        let mut buffer = Vec::new();
        store.snapshot(&mut buffer).unwrap();

        let fresh = CacheStore::new();
        assert_eq!(fresh.restore(buffer.as_slice()).unwrap(), 1);

        // The restored entry is pre-settled; a request never spawns.
        let calls = Arc::new(AtomicUsize::new(0));
        let (entry, spawned) = {
            let calls = calls.clone();
            fresh.request(
                fp_ok,
                erased(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("never"))
                }),
                tx,
            )
        };
        assert!(!spawned);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        match entry.state() {
            Value::Ready(value) => {
                assert_eq!(
                    value.downcast_ref::<serde_json::Value>(),
                    Some(&json!({"status": 200}))
                );
            }
            _ => panic!("expected a restored ready entry"),
        }

        // Failed entries never make it into the snapshot.
        assert!(fresh.get(fp_err).is_none());
    }
}
