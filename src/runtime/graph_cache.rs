//! Engine-wide cache of contract object graphs, keyed by content hash.

use super::{Host, RuntimeError};
use crate::types::{ObjectGraph, Status};
use alloy_primitives::{keccak256, B256};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Saves re-sending large graphs over the wire.
///
/// Loading first asks the peer for the hash only; the full graph is fetched
/// only when that hash is not cached. Storing skips the graph bytes when they
/// did not change.
pub struct ObjectGraphCache {
    inner: Mutex<LruCache<B256, Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ObjectGraphCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, hash: &B256) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().get(hash).cloned()
    }

    pub fn insert(&self, graph: Vec<u8>) -> B256 {
        let hash = keccak256(&graph);
        self.inner.lock().put(hash, Arc::new(graph));
        hash
    }

    /// Loads the current graph of the invoked contract, with its bytes.
    pub fn load(&self, host: &mut dyn Host) -> Result<ObjectGraph, RuntimeError> {
        let summary = host.get_object_graph(false)?;
        if let Some(graph) = self.get(&summary.graph_hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(hash = %summary.graph_hash, "object graph cache hit");
            return Ok(ObjectGraph {
                graph_data: Some(graph.as_ref().clone()),
                ..summary
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let full = host.get_object_graph(true)?;
        let data = full.graph_data.unwrap_or_default();
        if keccak256(&data) != full.graph_hash {
            return Err(RuntimeError::failure(
                Status::InvalidInstance,
                "object graph does not match its hash",
            ));
        }
        self.inner.lock().put(full.graph_hash, Arc::new(data.clone()));
        Ok(ObjectGraph {
            next_hash: full.next_hash,
            graph_hash: full.graph_hash,
            graph_data: Some(data),
        })
    }

    /// Stores a graph after execution. `loaded` is what [`load`](Self::load)
    /// returned for this invocation.
    pub fn store(
        &self,
        host: &mut dyn Host,
        loaded: &ObjectGraph,
        next_hash: u32,
        graph: Vec<u8>,
    ) -> Result<(), RuntimeError> {
        let hash = keccak256(&graph);
        if hash == loaded.graph_hash {
            return host.set_object_graph(false, next_hash, &[]);
        }
        host.set_object_graph(true, next_hash, &graph)?;
        self.inner.lock().put(hash, Arc::new(graph));
        Ok(())
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::value::Value;
    use crate::types::{InvokeResult, LogLevel};
    use address_monitor::Address;
    use alloy_primitives::U256;
    use std::collections::BTreeMap;

    /// Host holding one graph, counting full transfers.
    struct GraphHost {
        next_hash: u32,
        graph: Vec<u8>,
        full_fetches: usize,
        full_stores: usize,
    }

    impl Host for GraphHost {
        fn get_info(&mut self) -> Result<BTreeMap<String, Value>, RuntimeError> {
            Ok(BTreeMap::new())
        }
        fn get_balance(&mut self, _: &Address) -> Result<U256, RuntimeError> {
            Ok(U256::ZERO)
        }
        fn get_value(&mut self, _: &[u8]) -> Result<Option<Vec<u8>>, RuntimeError> {
            Ok(None)
        }
        fn set_value(&mut self, _: &[u8], _: Option<&[u8]>) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn set_value_returning_size(
            &mut self,
            _: &[u8],
            _: Option<&[u8]>,
        ) -> Result<Option<usize>, RuntimeError> {
            Ok(None)
        }
        fn call(
            &mut self,
            _: &Address,
            _: U256,
            _: U256,
            _: &str,
            _: Vec<Value>,
        ) -> Result<InvokeResult, RuntimeError> {
            Err(RuntimeError::failure(Status::UnknownFailure, "no calls"))
        }
        fn event(&mut self, _: Vec<Vec<u8>>, _: Vec<Vec<u8>>) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn log(&mut self, _: LogLevel, _: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn get_object_graph(&mut self, want_full: bool) -> Result<ObjectGraph, RuntimeError> {
            if want_full {
                self.full_fetches += 1;
            }
            Ok(ObjectGraph {
                next_hash: self.next_hash,
                graph_hash: keccak256(&self.graph),
                graph_data: want_full.then(|| self.graph.clone()),
            })
        }
        fn set_object_graph(
            &mut self,
            include_graph: bool,
            next_hash: u32,
            graph: &[u8],
        ) -> Result<(), RuntimeError> {
            self.next_hash = next_hash;
            if include_graph {
                self.full_stores += 1;
                self.graph = graph.to_vec();
            }
            Ok(())
        }
        fn set_code(&mut self, _: &[u8]) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn set_fee_proportion(&mut self, _: i64) -> Result<(), RuntimeError> {
            Ok(())
        }
        fn is_trace(&self) -> bool {
            false
        }
    }

    #[test]
    fn test_hit_skips_full_fetch() {
        let cache = ObjectGraphCache::new(4);
        let mut host = GraphHost {
            next_hash: 3,
            graph: b"heap-v1".to_vec(),
            full_fetches: 0,
            full_stores: 0,
        };

        let first = cache.load(&mut host).unwrap();
        assert_eq!(host.full_fetches, 1);
        assert_eq!(cache.misses(), 1);

        let second = cache.load(&mut host).unwrap();
        assert_eq!(host.full_fetches, 1);
        assert_eq!(cache.hits(), 1);
        assert_eq!(first, second);
        assert_eq!(second.graph_data.as_deref(), Some(b"heap-v1".as_slice()));
    }

    #[test]
    fn test_store_sends_graph_only_when_changed() {
        let cache = ObjectGraphCache::new(4);
        let mut host = GraphHost {
            next_hash: 0,
            graph: Vec::new(),
            full_fetches: 0,
            full_stores: 0,
        };

        let loaded = cache.load(&mut host).unwrap();
        cache.store(&mut host, &loaded, 1, Vec::new()).unwrap();
        assert_eq!(host.full_stores, 0);
        assert_eq!(host.next_hash, 1);

        cache.store(&mut host, &loaded, 2, b"new".to_vec()).unwrap();
        assert_eq!(host.full_stores, 1);

        // The stored graph is now cached, so loading it costs no transfer.
        let reloaded = cache.load(&mut host).unwrap();
        assert_eq!(host.full_fetches, 1);
        assert_eq!(reloaded.next_hash, 2);
        assert_eq!(reloaded.graph_data, Some(b"new".to_vec()));
    }

    #[test]
    fn test_zero_capacity_still_caches_one() {
        let cache = ObjectGraphCache::new(0);
        let hash = cache.insert(b"a".to_vec());
        assert!(cache.get(&hash).is_some());
        assert_eq!(cache.len(), 1);
    }
}
