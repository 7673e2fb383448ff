//! Zone-backed shared-ownership handles.
//!
//! VM objects are not heap values: every [`Map`](crate::Map) and
//! [`MapEntry`](crate::MapEntry) lives in a slot of its type's
//! [`Zone`]. [`ZoneArc`] is the strong handle to such a slot and
//! [`ZoneWeak`] the non-owning companion used for back-references that
//! must not form cycles.
//!
//! Reference counts sit in the slot header next to the value, `Arc`
//! style: the strong handles collectively own one weak reference, the
//! value is destroyed in place when the last strong handle drops, and
//! the slot returns to its zone when the last handle of any kind drops.

use crate::zone::Zone;
use core::mem::ManuallyDrop;
use core::ops::Deref;
use core::ptr::NonNull;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

/// A type whose instances are stored in a dedicated zone.
pub trait ZoneObject: Sized + 'static {
    /// The zone backing every instance of this type.
    fn zone() -> &'static Zone<RcSlot<Self>>;
}

/// One zone slot: reference counts plus the stored value.
pub struct RcSlot<T> {
    strong: AtomicUsize,
    /// Weak handles, plus one held collectively by the strong handles.
    weak: AtomicUsize,
    value: ManuallyDrop<T>,
}

/// Strong handle to a zone-allocated `T`.
pub struct ZoneArc<T: ZoneObject> {
    slot: NonNull<RcSlot<T>>,
}

/// Non-owning handle to a zone-allocated `T`.
pub struct ZoneWeak<T: ZoneObject> {
    slot: NonNull<RcSlot<T>>,
}

// Safety: same contract as Arc/Weak — the counts serialize destruction,
// so handles may cross CPUs whenever the value itself may.
unsafe impl<T: ZoneObject + Send + Sync> Send for ZoneArc<T> {}
unsafe impl<T: ZoneObject + Send + Sync> Sync for ZoneArc<T> {}
unsafe impl<T: ZoneObject + Send + Sync> Send for ZoneWeak<T> {}
unsafe impl<T: ZoneObject + Send + Sync> Sync for ZoneWeak<T> {}

impl<T: ZoneObject> ZoneArc<T> {
    /// Move `value` into a fresh slot of its type's zone.
    ///
    /// `None` when the zone can provide no slot — its seed region is
    /// full and the region source is absent or exhausted.
    #[must_use]
    pub fn new(value: T) -> Option<Self> {
        let slot = T::zone().alloc()?;
        // Safety: the zone handed us an exclusive, properly aligned slot.
        unsafe {
            slot.as_ptr().write(RcSlot {
                strong: AtomicUsize::new(1),
                weak: AtomicUsize::new(1),
                value: ManuallyDrop::new(value),
            });
        }
        Some(Self { slot })
    }

    /// Whether two handles designate the same slot.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.slot == b.slot
    }

    /// A non-owning handle to the same slot.
    #[must_use]
    pub fn downgrade(this: &Self) -> ZoneWeak<T> {
        this.header().weak.fetch_add(1, Ordering::Relaxed);
        ZoneWeak { slot: this.slot }
    }

    fn header(&self) -> &RcSlot<T> {
        // Safety: a live strong handle keeps the slot allocated.
        unsafe { self.slot.as_ref() }
    }
}

impl<T: ZoneObject> Deref for ZoneArc<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.header().value
    }
}

impl<T: ZoneObject> Clone for ZoneArc<T> {
    fn clone(&self) -> Self {
        self.header().strong.fetch_add(1, Ordering::Relaxed);
        Self { slot: self.slot }
    }
}

impl<T: ZoneObject> Drop for ZoneArc<T> {
    fn drop(&mut self) {
        if self.header().strong.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }
        // Synchronize with every other release before running the
        // destructor.
        fence(Ordering::Acquire);
        // Safety: we observed the last strong count; nobody else can
        // reach the value anymore.
        unsafe {
            ManuallyDrop::drop(&mut (*self.slot.as_ptr()).value);
        }
        release_weak::<T>(self.slot);
    }
}

impl<T: ZoneObject> ZoneWeak<T> {
    /// A strong handle, unless the value has already been destroyed.
    #[must_use]
    pub fn upgrade(&self) -> Option<ZoneArc<T>> {
        let strong = &self.header().strong;
        let mut count = strong.load(Ordering::Relaxed);
        loop {
            if count == 0 {
                return None;
            }
            match strong.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(ZoneArc { slot: self.slot }),
                Err(current) => count = current,
            }
        }
    }

    /// Address of the stored value, for identity comparisons only. The
    /// value may already be destroyed; never dereference this.
    #[must_use]
    pub fn as_ptr(&self) -> *const T {
        // Safety: only the address is formed; the slot outlives every
        // handle.
        unsafe { (&raw const (*self.slot.as_ptr()).value).cast::<T>() }
    }

    fn header(&self) -> &RcSlot<T> {
        // Safety: a live weak handle keeps the slot allocated.
        unsafe { self.slot.as_ref() }
    }
}

impl<T: ZoneObject> Clone for ZoneWeak<T> {
    fn clone(&self) -> Self {
        self.header().weak.fetch_add(1, Ordering::Relaxed);
        Self { slot: self.slot }
    }
}

impl<T: ZoneObject> Drop for ZoneWeak<T> {
    fn drop(&mut self) {
        release_weak::<T>(self.slot);
    }
}

/// Drop one weak count; the last one returns the slot to the zone.
fn release_weak<T: ZoneObject>(slot: NonNull<RcSlot<T>>) {
    // Safety: the caller held a weak count, so the slot is still live.
    let weak = unsafe { &(*slot.as_ptr()).weak };
    if weak.fetch_sub(1, Ordering::Release) == 1 {
        fence(Ordering::Acquire);
        T::zone().free(slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valloc::RegionSource;
    use std::alloc::{alloc, Layout};

    struct HeapSource;

    static HEAP: HeapSource = HeapSource;

    impl RegionSource for HeapSource {
        fn alloc_region(&self, len: usize) -> Option<NonNull<u8>> {
            let layout = Layout::from_size_align(len, 4096).unwrap();
            NonNull::new(unsafe { alloc(layout) })
        }
    }

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Probe(u64);

    impl Drop for Probe {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::Relaxed);
        }
    }

    static PROBE_ZONE: Zone<RcSlot<Probe>> = Zone::new("probes");

    impl ZoneObject for Probe {
        fn zone() -> &'static Zone<RcSlot<Probe>> {
            &PROBE_ZONE
        }
    }

    /// One sequential walk through the whole handle lifecycle; the zone
    /// and drop counter are globals, so splitting this up would race.
    #[test]
    fn handle_lifecycle() {
        PROBE_ZONE.set_source(&HEAP);

        // Clones share the slot; only the last drop destroys.
        let a = ZoneArc::new(Probe(41)).unwrap();
        let b = ZoneArc::clone(&a);
        assert!(ZoneArc::ptr_eq(&a, &b));
        assert_eq!(a.0 + b.0, 82);
        drop(a);
        assert_eq!(DROPS.load(Ordering::Relaxed), 0);
        drop(b);
        assert_eq!(DROPS.load(Ordering::Relaxed), 1);

        // Weak handles observe the value's lifetime without owning it.
        let strong = ZoneArc::new(Probe(7)).unwrap();
        let addr = &*strong as *const Probe as usize;
        let weak = ZoneArc::downgrade(&strong);
        assert_eq!(weak.as_ptr() as usize, addr);
        let upgraded = weak.upgrade().unwrap();
        assert_eq!(upgraded.0, 7);
        drop(upgraded);
        drop(strong);
        assert_eq!(DROPS.load(Ordering::Relaxed), 2);
        // The value is gone; the slot survives while the weak does.
        assert!(weak.upgrade().is_none());
        drop(weak);

        // The freed slot is the first candidate on the next allocation.
        let recycled = ZoneArc::new(Probe(2)).unwrap();
        assert_eq!(&*recycled as *const Probe as usize, addr);
    }
}
