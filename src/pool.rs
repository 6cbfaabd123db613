//! Free lists of reusable nodes, one per concrete node type.
//!
//! Taking a node transfers it entirely to the caller until it is given back.
//! The pool never inspects node contents: it is the node's own id discipline
//! (see [`fields`](crate::fields)) that guarantees a handle left over from a
//! previous occupant cannot observe or mutate the new one.

use crate::config;
use crossbeam::queue::SegQueue;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

static POOLS: Lazy<RwLock<HashMap<TypeId, &'static dyn ErasedPool>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

trait ErasedPool: Send + Sync {
    fn clear(&self);
    fn as_any(&self) -> &dyn Any;
}

pub(crate) struct Pool<N> {
    items: SegQueue<Arc<N>>,
    len: AtomicUsize,
}

impl<N: Send + Sync + 'static> Pool<N> {
    fn new() -> Self {
        Self {
            items: SegQueue::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Returns the process-wide pool for `N`.
    pub(crate) fn global() -> &'static Pool<N> {
        let key = TypeId::of::<N>();
        if let Some(pool) = POOLS.read().get(&key) {
            return downcast(*pool);
        }

        let mut pools = POOLS.write();
        let pool = *pools.entry(key).or_insert_with(|| {
            tracing::trace!(node = type_name::<N>(), "creating pool");
            let pool: &'static dyn ErasedPool = Box::leak(Box::new(Pool::<N>::new()));
            pool
        });
        downcast(pool)
    }

    pub(crate) fn take(&self) -> Option<Arc<N>> {
        let node = self.items.pop()?;
        self.len.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!(node = type_name::<N>(), "took node from pool");
        Some(node)
    }

    /// Gives `node` back. Dropped instead if pooling is disabled or the pool
    /// is full.
    pub(crate) fn give(&self, node: Arc<N>) {
        let Some(capacity) = config::pool_capacity() else {
            return;
        };
        if self.len.fetch_add(1, Ordering::Relaxed) >= capacity {
            self.len.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        tracing::trace!(node = type_name::<N>(), "returned node to pool");
        self.items.push(node);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, node: &Arc<N>) -> bool {
        let mut found = false;
        let mut seen = Vec::new();
        while let Some(item) = self.items.pop() {
            found |= Arc::ptr_eq(&item, node);
            seen.push(item);
        }
        for item in seen {
            self.items.push(item);
        }
        found
    }
}

impl<N: Send + Sync + 'static> ErasedPool for Pool<N> {
    fn clear(&self) {
        while self.take().is_some() {}
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn downcast<N: Send + Sync + 'static>(pool: &'static dyn ErasedPool) -> &'static Pool<N> {
    pool.as_any()
        .downcast_ref::<Pool<N>>()
        .unwrap_or_else(|| unreachable!("pool registered under the wrong type id"))
}

/// Drops every pooled object of every node type.
pub fn clear() {
    let pools = POOLS.read();
    for pool in pools.values() {
        pool.clear();
    }
    tracing::debug!(pools = pools.len(), "cleared object pools");
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Dummy(#[allow(dead_code)] u8);

    #[test]
    fn pools_are_keyed_by_type() {
        let a = Pool::<Dummy>::global();
        let b = Pool::<Dummy>::global();
        assert!(std::ptr::eq(a, b));

        let node = Arc::new(Dummy(1));
        a.give(node.clone());
        assert!(b.contains(&node));
        let taken = b.take().unwrap();
        assert!(Arc::ptr_eq(&taken, &node));
    }
}
