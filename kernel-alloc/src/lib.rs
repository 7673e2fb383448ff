//! # Physical page-frame allocation
//!
//! The owner of every usable physical page frame in the machine. Regions
//! arrive from the bootloader's memory map after boot; frames are
//! dispensed and reclaimed in [`PAGE_SIZE`](kernel_info::layout::PAGE_SIZE)
//! units through [`PhysAllocator`], which also implements the
//! [`FrameSource`](kernel_vmem::FrameSource) seam the page-table walker
//! and anonymous regions draw from.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code)]

mod frame_alloc;

pub use frame_alloc::{PhysAllocator, PHYS_ALLOCATOR};
