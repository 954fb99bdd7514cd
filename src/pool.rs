//! Reusable buffer pools.
//!
//! Frame-sized buffers are reserved once at startup and recycled:
//! - `Pool::get` checks an item out, running the reset hook first.
//! - Dropping the `Pooled` handle returns the item.
//!
//! Capacity is derived from queue depth, so an empty pool is a sizing bug,
//! reported as `PoolExhausted`.

use image::{GrayImage, RgbImage};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Every reserved item is checked out.
#[derive(Debug, Error)]
#[error("{pool} pool exhausted: all {capacity} buffers are checked out")]
pub struct PoolExhausted {
    pub pool: &'static str,
    pub capacity: usize,
}

type ResetHook<T> = Box<dyn Fn(&mut T) + Send + Sync>;

struct PoolInner<T> {
    name: &'static str,
    free: Mutex<Vec<T>>,
    capacity: AtomicUsize,
    reset: Option<ResetHook<T>>,
}

impl<T> PoolInner<T> {
    fn free(&self) -> MutexGuard<'_, Vec<T>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fixed-size pool of reusable items. Cloning shares the pool.
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Pool<T> {
    pub fn new(name: &'static str) -> Self {
        Self::build(name, None)
    }

    /// Pool whose items are passed through `reset` on every checkout.
    pub fn with_reset(name: &'static str, reset: impl Fn(&mut T) + Send + Sync + 'static) -> Self {
        Self::build(name, Some(Box::new(reset)))
    }

    fn build(name: &'static str, reset: Option<ResetHook<T>>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name,
                free: Mutex::new(Vec::new()),
                capacity: AtomicUsize::new(0),
                reset,
            }),
        }
    }

    /// Pre-allocates `count` more items.
    pub fn reserve(&self, count: usize, mut factory: impl FnMut() -> T) {
        let mut free = self.inner.free();
        free.reserve(count);
        for _ in 0..count {
            free.push(factory());
        }
        self.inner.capacity.fetch_add(count, Ordering::Relaxed);
    }

    /// Checks out a free item.
    pub fn get(&self) -> Result<Pooled<T>, PoolExhausted> {
        let item = self.inner.free().pop();
        let mut item = item.ok_or_else(|| PoolExhausted {
            pool: self.inner.name,
            capacity: self.capacity(),
        })?;
        if let Some(reset) = &self.inner.reset {
            reset(&mut item);
        }
        Ok(Pooled {
            item: Some(item),
            pool: self.inner.clone(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Total items ever reserved.
    pub fn capacity(&self) -> usize {
        self.inner.capacity.load(Ordering::Relaxed)
    }

    /// Items currently free.
    pub fn available(&self) -> usize {
        self.inner.free().len()
    }
}

/// Image buffers that can be allocated at a given shape.
pub trait PixelBuffer: Sized {
    fn blank(width: u32, height: u32) -> Self;
}

impl PixelBuffer for GrayImage {
    fn blank(width: u32, height: u32) -> Self {
        GrayImage::new(width, height)
    }
}

impl PixelBuffer for RgbImage {
    fn blank(width: u32, height: u32) -> Self {
        RgbImage::new(width, height)
    }
}

impl<T: PixelBuffer> Pool<T> {
    /// Pre-allocates `count` images of `width` x `height`.
    pub fn reserve_images(&self, count: usize, width: u32, height: u32) {
        log::debug!(
            "{} pool: reserving {} buffers of {}x{}",
            self.inner.name,
            count,
            width,
            height
        );
        self.reserve(count, || T::blank(width, height));
    }
}

/// A checked-out pool item. Returns to its pool on drop.
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<PoolInner<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item present until drop")
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name)
            .field("item", &self.item)
            .finish()
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.free().push(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn live_checkouts_never_alias() {
        let pool: Pool<GrayImage> = Pool::new("gray");
        pool.reserve_images(4, 8, 8);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.get().expect("within capacity"));
        }
        let addresses: HashSet<_> = held.iter().map(|b| b.as_raw().as_ptr() as usize).collect();
        assert_eq!(addresses.len(), 4);
        assert_eq!(pool.available(), 0);

        // Release two, check out two again: still no aliasing with the ones held.
        held.truncate(2);
        held.push(pool.get().unwrap());
        held.push(pool.get().unwrap());
        let addresses: HashSet<_> = held.iter().map(|b| b.as_raw().as_ptr() as usize).collect();
        assert_eq!(addresses.len(), 4);
    }

    #[test]
    fn exhausted_pool_reports_sizing_error() {
        let pool: Pool<RgbImage> = Pool::new("rgb");
        pool.reserve_images(1, 4, 4);
        let _held = pool.get().unwrap();

        let err = pool.get().unwrap_err();
        assert_eq!(err.pool, "rgb");
        assert_eq!(err.capacity, 1);
    }

    #[test]
    fn drop_returns_buffer() {
        let pool: Pool<GrayImage> = Pool::new("gray");
        pool.reserve_images(2, 4, 4);
        {
            let _a = pool.get().unwrap();
            let _b = pool.get().unwrap();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn reset_hook_runs_on_checkout() {
        let pool = Pool::with_reset("messages", |v: &mut Vec<u32>| v.clear());
        pool.reserve(1, || Vec::with_capacity(16));
        {
            let mut v = pool.get().unwrap();
            v.extend([1, 2, 3]);
        }
        let v = pool.get().unwrap();
        assert!(v.is_empty());
        assert!(v.capacity() >= 16);
    }
}
