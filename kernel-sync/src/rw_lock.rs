use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicU32, Ordering},
};

/// Sentinel state meaning a writer holds the lock.
const WRITER: u32 = u32::MAX;

/// A spinning reader-writer lock.
///
/// State is a single counter: `0` unlocked, `1..WRITER` the number of
/// active readers, [`WRITER`] an exclusive holder. Writers do not get
/// priority; a steady stream of readers can starve them, which is
/// acceptable for the short, rare write sections in the VM core
/// (placement insertion and removal).
pub struct RwSpinLock<T> {
    state: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: access to the inner value is serialized by the reader/writer
// protocol below.
unsafe impl<T: Send> Send for RwSpinLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    #[must_use]
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Acquire shared access; spins while a writer is active.
    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state != WRITER
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return RwSpinReadGuard { lock: self };
            }
            spin_loop();
        }
    }

    /// Acquire exclusive access; spins while any guard is alive.
    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            if self
                .state
                .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return RwSpinWriteGuard { lock: self };
            }
            spin_loop();
        }
    }

    /// Direct access through `&mut self`; no contention is possible.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: reader count is nonzero, so no writer can be active.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: the WRITER state excludes all other guards.
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the WRITER state excludes all other guards.
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}

