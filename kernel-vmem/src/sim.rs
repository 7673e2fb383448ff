//! Simulated physical machine for host-run tests.
//!
//! Compiled for this crate's own tests and, behind the `sim` feature, for
//! the test suites of the crates layered above. Nothing here is meant for
//! a real kernel build.

extern crate alloc;

use crate::addresses::PhysAddr;
use crate::layout;
use crate::phys::{FrameSource, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_sync::SpinLock;

#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Sparse simulated RAM.
///
/// Any frame touched springs into existence zero-filled, so tests can use
/// arbitrary physical layouts (boot memory maps with multi-gigabyte
/// bases) without reserving host memory for the gaps.
pub struct TestPhys {
    frames: SpinLock<BTreeMap<u64, Box<Frame>>>,
}

impl TestPhys {
    #[must_use]
    pub fn new() -> Self {
        Self {
            frames: SpinLock::new(BTreeMap::new()),
        }
    }

    /// A leaked instance, for the `&'static` seams.
    #[must_use]
    pub fn leaked() -> &'static Self {
        Box::leak(Box::new(Self::new()))
    }
}

impl Default for TestPhys {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMapper for TestPhys {
    fn phys_to_ptr(&self, pa: PhysAddr) -> *mut u8 {
        let base = pa.page_base().as_u64();
        let offset = pa.page_offset() as usize;
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(base)
            .or_insert_with(|| Box::new(Frame([0; 4096])));
        // Box contents are address-stable across tree growth.
        unsafe { (frame.0.as_ptr() as *mut u8).add(offset) }
    }
}

/// Bump frame source that records frees, for ownership accounting.
pub struct CountingFrames {
    state: SpinLock<CountingState>,
}

struct CountingState {
    next: u64,
    end: u64,
    allocated: usize,
    freed: Vec<PhysAddr>,
}

impl CountingFrames {
    #[must_use]
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            state: SpinLock::new(CountingState {
                next: start,
                end,
                allocated: 0,
                freed: Vec::new(),
            }),
        }
    }

    /// A leaked instance, for the `&'static` seams.
    #[must_use]
    pub fn leaked(start: u64, end: u64) -> &'static Self {
        Box::leak(Box::new(Self::new(start, end)))
    }

    /// Frames handed out so far.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }

    /// Frames returned so far.
    #[must_use]
    pub fn freed(&self) -> usize {
        self.state.lock().freed.len()
    }
}

impl FrameSource for CountingFrames {
    fn alloc_frame(&self) -> Option<PhysAddr> {
        let mut s = self.state.lock();
        if s.next + layout::PAGE_SIZE > s.end {
            return None;
        }
        let pa = PhysAddr::new(s.next);
        s.next += layout::PAGE_SIZE;
        s.allocated += 1;
        Some(pa)
    }

    fn free_frame(&self, frame: PhysAddr) {
        let mut s = self.state.lock();
        assert!(
            !s.freed.contains(&frame),
            "double free of test frame {frame}"
        );
        s.freed.push(frame);
    }
}
