//! Reuse of small, frequently allocated objects (e.g. ARQ segments), keyed by their type.

use std::any::{Any, TypeId};
use rustc_hash::FxHashMap;
use tracing::trace;

/// An object that can be reset to a pristine state for reuse.
pub trait Recyclable: Default + Send + 'static {
    fn reset(&mut self);
}

/// Per-type free lists of recyclable objects. Each list holds at most `max_per_type` objects,
///  objects recycled beyond that are dropped.
///
/// This is owned by a single service and used from its update loop, so there is no locking.
pub struct ObjectPool {
    max_per_type: usize,
    pools: FxHashMap<TypeId, Vec<Box<dyn Any + Send>>>,
}

impl ObjectPool {
    pub fn new(max_per_type: usize) -> ObjectPool {
        ObjectPool {
            max_per_type,
            pools: Default::default(),
        }
    }

    /// a pooled object if there is one, a fresh default instance otherwise
    pub fn fetch<T: Recyclable>(&mut self) -> T {
        self.pools.get_mut(&TypeId::of::<T>())
            .and_then(|pool| pool.pop())
            .and_then(|o| o.downcast::<T>().ok())
            .map(|o| *o)
            .unwrap_or_default()
    }

    pub fn recycle<T: Recyclable>(&mut self, mut o: T) {
        let pool = self.pools.entry(TypeId::of::<T>()).or_default();
        if pool.len() >= self.max_per_type {
            trace!("object pool for {} is full - dropping object", std::any::type_name::<T>());
            return;
        }
        o.reset();
        pool.push(Box::new(o));
    }

    pub fn pooled<T: Recyclable>(&self) -> usize {
        self.pools.get(&TypeId::of::<T>())
            .map(|pool| pool.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Data {
        value: u32,
        items: Vec<u8>,
    }
    impl Recyclable for Data {
        fn reset(&mut self) {
            self.value = 0;
            self.items.clear();
        }
    }

    #[derive(Default)]
    struct Other;
    impl Recyclable for Other {
        fn reset(&mut self) {}
    }

    #[test]
    fn test_fetch_from_empty_pool() {
        let mut pool = ObjectPool::new(10);
        assert_eq!(pool.fetch::<Data>(), Data::default());
    }

    #[test]
    fn test_recycle_resets_and_reuses() {
        let mut pool = ObjectPool::new(10);

        let mut items = Vec::with_capacity(100);
        items.push(5);
        pool.recycle(Data { value: 3, items });
        assert_eq!(pool.pooled::<Data>(), 1);
        assert_eq!(pool.pooled::<Other>(), 0);

        let data = pool.fetch::<Data>();
        assert_eq!(data.value, 0);
        assert!(data.items.is_empty());
        assert!(data.items.capacity() >= 100);
        assert_eq!(pool.pooled::<Data>(), 0);
    }

    #[test]
    fn test_pools_per_type() {
        let mut pool = ObjectPool::new(10);
        pool.recycle(Other);
        pool.recycle(Other);
        pool.recycle(Data::default());

        assert_eq!(pool.pooled::<Other>(), 2);
        assert_eq!(pool.pooled::<Data>(), 1);
    }

    #[test]
    fn test_cap() {
        let mut pool = ObjectPool::new(3);
        for _ in 0..5 {
            pool.recycle(Other);
        }
        assert_eq!(pool.pooled::<Other>(), 3);
    }
}
