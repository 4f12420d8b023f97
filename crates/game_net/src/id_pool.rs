//! Bounded pool of recyclable identifiers.
//!
//! The pool is pre-loaded with `max` values produced by a generator. Neither
//! `get` nor `set` ever blocks: an empty pool falls back to the generator and
//! a full pool hands surplus values to an optional destructor.

use crossbeam::queue::ArrayQueue;
use std::fmt;

type Generator<T> = Box<dyn Fn(u64) -> T + Send + Sync>;
type Destructor<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct IdPool<T> {
    ids: ArrayQueue<T>,
    generator: Generator<T>,
    on_destroy: Option<Destructor<T>>,
    max: usize,
}

impl<T> IdPool<T> {
    /// Creates a pool holding `generator(0) .. generator(max - 1)`.
    pub fn new<F>(max: usize, generator: F) -> Self
    where
        F: Fn(u64) -> T + Send + Sync + 'static,
    {
        // ArrayQueue rejects a zero capacity
        let ids = ArrayQueue::new(max.max(1));
        for idx in 0..max {
            // Cannot fail: exactly `max` pushes into a queue of capacity >= max
            let _ = ids.push(generator(idx as u64));
        }

        Self {
            ids,
            generator: Box::new(generator),
            on_destroy: None,
            max,
        }
    }

    /// Installs a callback invoked with values that do not fit back into the pool.
    pub fn with_on_destroy<F>(mut self, on_destroy: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_destroy = Some(Box::new(on_destroy));
        self
    }

    /// Pops a pooled value, or synthesizes `generator(0)` when the pool is empty.
    ///
    /// The fallback may duplicate a value already handed out. Callers that need
    /// uniqueness use [`IdPool::try_get`].
    pub fn get(&self) -> T {
        self.ids.pop().unwrap_or_else(|| (self.generator)(0))
    }

    /// Pops a pooled value without any fallback.
    pub fn try_get(&self) -> Option<T> {
        self.ids.pop()
    }

    /// Returns a value to the pool. A full pool drops it through the destructor.
    pub fn set(&self, value: T) {
        let rejected = if self.max == 0 {
            Some(value)
        } else {
            self.ids.push(value).err()
        };

        if let (Some(value), Some(on_destroy)) = (rejected, &self.on_destroy) {
            on_destroy(value);
        }
    }

    /// Number of values currently available.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Configured number of values.
    pub fn max(&self) -> usize {
        self.max
    }
}

impl IdPool<u32> {
    /// Pool pre-loaded with `1..=max`.
    pub fn sequential(max: u32) -> Self {
        Self::new(max as usize, |idx| idx as u32 + 1)
    }
}

impl<T> fmt::Debug for IdPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdPool")
            .field("available", &self.ids.len())
            .field("max", &self.max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_sequential_preload() {
        let pool = IdPool::sequential(3);
        assert_eq!(pool.len(), 3);

        let mut ids = vec![pool.get(), pool.get(), pool.get()];
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_get_then_set_is_reusable() {
        let pool = IdPool::sequential(1);
        let id = pool.get();
        assert!(pool.try_get().is_none());

        pool.set(id);
        assert_eq!(pool.try_get(), Some(id));
    }

    #[test]
    fn test_empty_pool_falls_back_to_generator() {
        let pool = IdPool::sequential(1);
        let _ = pool.get();
        assert_eq!(pool.get(), 1);
        assert!(pool.try_get().is_none());
    }

    #[test]
    fn test_set_on_full_pool_does_not_grow() {
        let destroyed = Arc::new(AtomicUsize::new(0));
        let counter = destroyed.clone();
        let pool = IdPool::sequential(2).with_on_destroy(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        pool.set(99);
        pool.set(100);

        assert_eq!(pool.len(), 2);
        assert_eq!(destroyed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_zero_sized_pool() {
        let pool = IdPool::sequential(0);
        assert_eq!(pool.max(), 0);
        assert!(pool.try_get().is_none());

        pool.set(5);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_generic_values() {
        let pool = IdPool::new(2, |idx| format!("slot-{idx}"));
        let mut values = vec![pool.get(), pool.get()];
        values.sort();
        assert_eq!(values, vec!["slot-0".to_string(), "slot-1".to_string()]);
    }
}
