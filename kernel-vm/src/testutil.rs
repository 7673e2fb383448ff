//! Shared harness for the crate's tests: a recording CPU backend over
//! the simulated physical machine from `kernel_vmem::sim`, plus a
//! host-heap region source standing in for the virtual page allocator
//! behind the VM-object zones.
//!
//! Tests lease distinct CPU indices so their per-CPU state never
//! collides even though the suites run in one process; IPIs are
//! delivered synchronously by impersonating the target CPU for the
//! duration of the drain.

use crate::entry::MapEntry;
use crate::handle::{ZoneArc, ZoneObject};
use crate::map::Map;
use crate::shootdown;
use crate::valloc::RegionSource;
use alloc::vec::Vec;
use core::cell::Cell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::layout::MAX_CPUS;
use kernel_sync::SpinLock;
use kernel_vmem::cpu::{self, CpuOps};
use kernel_vmem::{PhysAddr, VirtAddr};

pub use kernel_vmem::sim::{CountingFrames, TestPhys};

#[derive(Clone, Default)]
pub struct CpuEvents {
    pub invalidations: Vec<u64>,
    pub root_loads: Vec<u64>,
    pub ipis: usize,
}

struct SimCpu {
    cpus: [SpinLock<CpuEvents>; MAX_CPUS],
}

static SIM: SimCpu = SimCpu {
    cpus: [const {
        SpinLock::new(CpuEvents {
            invalidations: Vec::new(),
            root_loads: Vec::new(),
            ipis: 0,
        })
    }; MAX_CPUS],
};

static NEXT_CPU: AtomicUsize = AtomicUsize::new(1);

std::thread_local! {
    static CPU_ID: Cell<usize> = const { Cell::new(0) };
}

impl CpuOps for SimCpu {
    fn current_cpu(&self) -> usize {
        CPU_ID.with(Cell::get)
    }

    fn load_root(&self, root: PhysAddr) {
        self.cpus[self.current_cpu()]
            .lock()
            .root_loads
            .push(root.as_u64());
    }

    fn invalidate_page(&self, virt: VirtAddr) {
        self.cpus[self.current_cpu()]
            .lock()
            .invalidations
            .push(virt.as_u64());
    }

    fn send_shootdown_ipi(&self, target: usize) {
        self.cpus[target].lock().ipis += 1;
        // Deliver synchronously: become the target CPU, drain, return.
        let prev = self.current_cpu();
        set_cpu(target);
        shootdown::handle_ipi();
        set_cpu(prev);
    }
}

/// Host-heap region source standing in for the virtual page allocator.
struct HeapRegions;

static HEAP_REGIONS: HeapRegions = HeapRegions;

impl RegionSource for HeapRegions {
    fn alloc_region(&self, len: usize) -> Option<NonNull<u8>> {
        let layout = std::alloc::Layout::from_size_align(len, 4096).unwrap();
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }
}

/// Make the simulator the process-wide CPU backend and give the
/// VM-object zones a region source.
pub fn install() {
    cpu::install(&SIM);
    Map::zone().set_source(&HEAP_REGIONS);
    MapEntry::zone().set_source(&HEAP_REGIONS);
}

/// A CPU index no other test is using; the calling thread becomes it.
pub fn lease_cpu() -> usize {
    install();
    let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed);
    assert!(id < MAX_CPUS, "test suite leased too many CPUs");
    set_cpu(id);
    id
}

/// Point the calling thread at `cpu`.
pub fn set_cpu(cpu: usize) {
    CPU_ID.with(|c| c.set(cpu));
}

/// Snapshot of everything recorded for `cpu`.
pub fn events(cpu: usize) -> CpuEvents {
    SIM.cpus[cpu].lock().clone()
}

/// Forget everything recorded for `cpu`.
pub fn clear_events(cpu: usize) {
    *SIM.cpus[cpu].lock() = CpuEvents::default();
}

/// A root map over fresh simulated RAM, plus its frame source.
pub fn fresh_root_map() -> (ZoneArc<Map>, &'static CountingFrames) {
    install();
    let mapper = TestPhys::leaked();
    let frames = CountingFrames::leaked(0x100_0000, 0x100_0000 + (64 << 20));
    let map = Map::root(mapper, frames).expect("root map");
    (map, frames)
}

/// Deterministic xorshift generator for randomized placement tests.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Uniform-ish value in `[0, bound)`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
