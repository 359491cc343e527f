// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Segregated free-list allocator over a caller-provided buffer.
//!
//! The allocator header lives at the start of the buffer and every link it
//! keeps is a self-relative `i32` offset, so the whole heap is position
//! independent. Each allocation is preceded by an 8-byte [`MemNode`] header;
//! free nodes additionally use their first 8 payload bytes for the doubly
//! linked free list of their size class.
//!
//! 59 size classes: classes 0..=3 are the exact sizes 8..=32, classes 4..=57
//! follow a geometric progression with ratio 2^(1/4) rounded up to a multiple
//! of 8, and class 58 holds everything above 2^16 units of 8 bytes and is
//! searched linearly. Free-list insertion is LIFO.
//!
//! Freed and split payloads are zero-filled so region snapshots compress
//! well.
//!
//! All functions here are `unsafe` and expect the caller (the
//! [`SharedAlloc`](crate::shared_alloc::SharedAlloc) wrapper) to serialize
//! access and to pass pointers into a live, initialized region.

use crate::error::LeakedBlock;
use core::mem;
use core::ptr;
use once_cell::sync::Lazy;

pub const ALIGN: usize = 8;
pub const SIZES_COUNT: usize = 59;

const ALLOC_NODE_SIZE: usize = 8;
const ALLOCATED_FLAG: u32 = 1;

/// Allocator header. The `head` word exists so the fake head node of size
/// class 0 has somewhere to read its `prev_node_size` field from; see
/// [`head`].
#[repr(C)]
pub struct MiniMalloc {
    head: i32,
    free_nodes: [i32; SIZES_COUNT],
}

#[repr(C)]
struct MemNode {
    // allocatable size in bytes
    size: u32,
    // 0 if this is the first node in the block; low bit set if allocated
    prev_node_size: u32,
    d_next_free_node: i32,
    d_prev_free_node: i32,
}

const _: () = assert!(mem::size_of::<MiniMalloc>() % ALIGN == 0);
const _: () = assert!(mem::size_of::<MemNode>() == 16);
const _: () = assert!(ALLOC_NODE_SIZE % ALIGN == 0);

// ---------------------------------------------------------------------------
// node helpers
// ---------------------------------------------------------------------------

#[inline]
unsafe fn is_allocated(node: *const MemNode) -> bool {
    (*node).prev_node_size & ALLOCATED_FLAG != 0
}

#[inline]
unsafe fn set_allocated(node: *mut MemNode) {
    (*node).prev_node_size |= ALLOCATED_FLAG;
}

#[inline]
unsafe fn set_unallocated(node: *mut MemNode) {
    (*node).prev_node_size &= !ALLOCATED_FLAG;
}

#[inline]
unsafe fn prev_node_size(node: *const MemNode) -> u32 {
    (*node).prev_node_size & !ALLOCATED_FLAG
}

#[inline]
unsafe fn set_prev_node_size(node: *mut MemNode, size: u32) {
    debug_assert!(is_allocated(node));
    (*node).prev_node_size = size | ALLOCATED_FLAG;
}

#[inline]
unsafe fn next_free(node: *mut MemNode) -> *mut MemNode {
    debug_assert!(!is_allocated(node));
    let d = (*node).d_next_free_node;
    if d == 0 {
        return ptr::null_mut();
    }
    (node as *mut u8).offset(d as isize) as *mut MemNode
}

#[inline]
unsafe fn prev_free(node: *mut MemNode) -> *mut MemNode {
    debug_assert!(!is_allocated(node));
    let d = (*node).d_prev_free_node;
    if d == 0 {
        return ptr::null_mut();
    }
    (node as *mut u8).offset(d as isize) as *mut MemNode
}

#[inline]
unsafe fn set_next_free(node: *mut MemNode, next: *mut MemNode) {
    debug_assert!(!is_allocated(node));
    if next.is_null() {
        (*node).d_next_free_node = 0;
        return;
    }
    (*node).d_next_free_node = (next as isize - node as isize) as i32;
}

#[inline]
unsafe fn set_prev_free(node: *mut MemNode, prev: *mut MemNode) {
    debug_assert!(!is_allocated(node));
    if prev.is_null() {
        (*node).d_prev_free_node = 0;
        return;
    }
    (*node).d_prev_free_node = (prev as isize - node as isize) as i32;
}

#[inline]
unsafe fn attach_free_nodes(node1: *mut MemNode, node2: *mut MemNode) {
    if !node1.is_null() {
        set_next_free(node1, node2);
    }
    if !node2.is_null() {
        set_prev_free(node2, node1);
    }
}

/// Physical predecessor, or null for the first node of the block.
#[inline]
unsafe fn prev_phys(node: *mut MemNode) -> *mut MemNode {
    let size = prev_node_size(node);
    if size == 0 {
        return ptr::null_mut();
    }
    (node as *mut u8).sub(size as usize + ALLOC_NODE_SIZE) as *mut MemNode
}

/// Physical successor, or null at the sentinel (size 0).
#[inline]
unsafe fn next_phys(node: *mut MemNode) -> *mut MemNode {
    let next = (node as *mut u8).add((*node).size as usize + ALLOC_NODE_SIZE) as *mut MemNode;
    if (*next).size == 0 {
        return ptr::null_mut();
    }
    next
}

/// Fake head node of a size class. Laid out so its `d_next_free_node` field
/// aliases `free_nodes[idx]`; only `prev_node_size` (read by debug asserts)
/// and `d_next_free_node` of this fake node are ever touched.
#[inline]
unsafe fn head(mm: *mut MiniMalloc, idx: usize) -> *mut MemNode {
    let slot = ptr::addr_of_mut!((*mm).free_nodes[idx]) as *mut u8;
    slot.sub(ALLOC_NODE_SIZE) as *mut MemNode
}

#[inline]
unsafe fn first_free(mm: *mut MiniMalloc, idx: usize) -> *mut MemNode {
    next_free(head(mm, idx))
}

unsafe fn prepend_free_node(mm: *mut MiniMalloc, node: *mut MemNode, idx: usize) {
    let old_first = first_free(mm, idx);
    attach_free_nodes(head(mm, idx), node);
    attach_free_nodes(node, old_first);
}

// ---------------------------------------------------------------------------
// size classes
// ---------------------------------------------------------------------------

#[inline]
fn uint64_log2(n: u64) -> u32 {
    debug_assert!(n > 0);
    63 - n.leading_zeros()
}

/// Smallest class whose nominal size is >= `size`.
fn size_index_upper(size: u32) -> usize {
    debug_assert_eq!(size as usize % ALIGN, 0);
    let units = (size as u64) / ALIGN as u64;
    if units <= 4 {
        return (units - 1) as usize;
    }
    if units > 1 << 16 {
        return SIZES_COUNT - 1;
    }
    // log2(units^4) compresses the 2^(1/4) progression onto integer indices;
    // units == 2^16 wraps units^4 to 0 and the wrapping_sub keeps the C
    // unsigned arithmetic semantics (index 58).
    let quad = units.wrapping_mul(units).wrapping_mul(units).wrapping_mul(units);
    (uint64_log2(quad.wrapping_sub(1)) - 5) as usize
}

/// Largest class whose nominal size is <= `size`.
fn size_index_lower(size: u32) -> usize {
    let sizes = size_classes();
    let mut idx = size_index_upper(size);
    while size < sizes[idx] {
        idx -= 1;
    }
    idx
}

/// Nominal size of each class, identical in every process.
fn size_classes() -> &'static [u32; SIZES_COUNT] {
    static SIZES: Lazy<[u32; SIZES_COUNT]> = Lazy::new(|| {
        let mut sizes = [0u32; SIZES_COUNT];
        for bits in 1u32..=64 {
            let size = ((2f64.powf(bits as f64 / 4.0) + 0.001) as u64) * ALIGN as u64;
            let idx = size_index_upper(size as u32);
            sizes[idx] = size as u32;
        }
        sizes
    });
    &SIZES
}

/// Zero-fill the payload beyond the free-list links.
unsafe fn set_zero(node: *mut MemNode) {
    let payload = (node as *mut u8).add(mem::size_of::<MemNode>());
    let skip = mem::size_of::<MemNode>() - ALLOC_NODE_SIZE;
    ptr::write_bytes(payload, 0, (*node).size as usize - skip);
}

// ---------------------------------------------------------------------------
// public (crate) entry points
// ---------------------------------------------------------------------------

/// Initializes the allocator header and the single free block covering the
/// rest of `blocksize` bytes, terminated by an allocated sentinel of size 0.
///
/// # Safety
/// `mm` must point to at least `blocksize` bytes of writable, 8-aligned
/// memory, and `blocksize` must leave room for the header, one minimal block
/// and the sentinel.
pub(crate) unsafe fn init_mini_malloc(mm: *mut MiniMalloc, blocksize: usize) {
    debug_assert!(blocksize > mem::size_of::<MiniMalloc>() + 2 * ALLOC_NODE_SIZE + ALIGN);
    debug_assert!(blocksize < (1usize << 31));
    (*mm).head = 0;
    (*mm).free_nodes = [0; SIZES_COUNT];

    let heap = (mm as *mut u8).add(mem::size_of::<MiniMalloc>());
    let heap_size = blocksize - mem::size_of::<MiniMalloc>();
    let block_node_size = (heap_size - 2 * ALLOC_NODE_SIZE) as u32;

    let block_node = heap as *mut MemNode;
    (*block_node).prev_node_size = 0; // first node, unallocated
    (*block_node).d_next_free_node = 0;
    set_prev_free(block_node, head(mm, SIZES_COUNT - 1));
    (*block_node).size = block_node_size;

    let last_node =
        (block_node as *mut u8).add(block_node_size as usize + ALLOC_NODE_SIZE) as *mut MemNode;
    (*last_node).prev_node_size = ALLOCATED_FLAG;
    (*last_node).size = 0;

    set_next_free(head(mm, SIZES_COUNT - 1), block_node);
    set_zero(block_node);
    debug_assert_eq!(
        (last_node as *mut u8).add(ALLOC_NODE_SIZE) as usize,
        mm as usize + blocksize
    );
}

/// Returns an 8-aligned pointer to `size` bytes, or null when no class yields
/// a fit.
///
/// # Safety
/// `mm` must be initialized and the call serialized with all other mutations.
pub(crate) unsafe fn mm_allocate(mm: *mut MiniMalloc, size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let mut size = size;
    if size % ALIGN != 0 {
        size += ALIGN - size % ALIGN;
    }
    if size >= (1usize << 31) {
        return ptr::null_mut();
    }
    let mut size = size as u32;

    let mut size_index = size_index_upper(size);
    if size_index < SIZES_COUNT - 1 {
        size = size_classes()[size_index];
    }

    // first non-empty class at or above the request
    let mut node = first_free(mm, size_index);
    while node.is_null() {
        size_index += 1;
        if size_index >= SIZES_COUNT {
            return ptr::null_mut();
        }
        node = first_free(mm, size_index);
    }
    debug_assert!((*node).size > 0);

    if size_index == SIZES_COUNT - 1 {
        // the overflow class holds mixed sizes; first fit, linear
        while !node.is_null() && (*node).size < size {
            node = next_free(node);
        }
        if node.is_null() {
            return ptr::null_mut();
        }
    }
    if (*node).size < size {
        return ptr::null_mut();
    }

    // split off the surplus if a minimal block fits
    let left_size = (*node).size as i64 - size as i64 - ALLOC_NODE_SIZE as i64;
    debug_assert!(left_size >= -(ALLOC_NODE_SIZE as i64));
    if left_size >= ALIGN as i64 {
        let left_size = left_size as u32;
        let left_index = size_index_lower(left_size);
        let new_node = (node as *mut u8).add(size as usize + ALLOC_NODE_SIZE) as *mut MemNode;
        (*new_node).size = left_size;
        (*node).size = size;
        (*new_node).d_prev_free_node = 0;
        (*new_node).d_next_free_node = 0;
        (*new_node).prev_node_size = (*node).size; // unallocated
        let next = next_phys(new_node);
        if !next.is_null() {
            set_prev_node_size(next, (*new_node).size);
        }
        prepend_free_node(mm, new_node, left_index);
        debug_assert_eq!(first_free(mm, left_index), new_node);
    }

    attach_free_nodes(prev_free(node), next_free(node));
    set_allocated(node);
    (node as *mut u8).add(ALLOC_NODE_SIZE)
}

unsafe fn join_with_next(mm: *mut MiniMalloc, node: *mut MemNode) {
    if node.is_null() || is_allocated(node) {
        return;
    }
    let next = next_phys(node);
    if next.is_null() || is_allocated(next) {
        return;
    }
    (*node).size += (*next).size + ALLOC_NODE_SIZE as u32;
    attach_free_nodes(prev_free(node), next_free(node));
    attach_free_nodes(prev_free(next), next_free(next));
    // stale header of the absorbed node
    ptr::write_bytes(next as *mut u8, 0, mem::size_of::<MemNode>());

    let next = next_phys(node);
    if !next.is_null() {
        set_prev_node_size(next, (*node).size);
    }
    let size_index = size_index_lower((*node).size);
    prepend_free_node(mm, node, size_index);
}

/// Returns a block to its size class and coalesces with both physical
/// neighbours. Two free neighbours never coexist afterwards.
///
/// # Safety
/// `ptr` must come from [`mm_allocate`] on the same region and the call must
/// be serialized with all other mutations.
pub(crate) unsafe fn mm_free(mm: *mut MiniMalloc, p: *mut u8) {
    if p.is_null() {
        return;
    }
    let node = p.sub(ALLOC_NODE_SIZE) as *mut MemNode;
    let size_index = size_index_lower((*node).size);
    set_unallocated(node);
    prepend_free_node(mm, node, size_index);
    set_zero(node);

    join_with_next(mm, node);
    join_with_next(mm, prev_phys(node));
}

/// Actual (quantized) size of the block behind an allocation.
///
/// # Safety
/// `p` must be a live allocation from this region.
pub(crate) unsafe fn mm_usable_size(p: *const u8) -> u32 {
    (*(p.sub(ALLOC_NODE_SIZE) as *const MemNode)).size
}

/// Walks the physical block chain and reports every block still allocated.
///
/// # Safety
/// `mm` must be initialized and quiescent.
pub(crate) unsafe fn mm_leaked_blocks(mm: *mut MiniMalloc) -> Vec<LeakedBlock> {
    let mut leaks = Vec::new();
    let mut node = (mm as *mut u8).add(mem::size_of::<MiniMalloc>()) as *mut MemNode;
    while !node.is_null() {
        if is_allocated(node) {
            leaks.push(LeakedBlock {
                offset: node as usize - mm as usize,
                size: (*node).size,
            });
        }
        node = next_phys(node);
    }
    leaks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_region(size: usize) -> (Vec<u64>, *mut MiniMalloc) {
        let words = size / 8;
        let mut buf = vec![0u64; words];
        let mm = buf.as_mut_ptr() as *mut MiniMalloc;
        unsafe { init_mini_malloc(mm, words * 8) };
        (buf, mm)
    }

    #[test]
    fn size_classes_are_monotonic() {
        let sizes = size_classes();
        assert_eq!(&sizes[..4], &[8, 16, 24, 32]);
        for i in 1..SIZES_COUNT {
            assert!(sizes[i] > sizes[i - 1]);
            assert_eq!(sizes[i] % 8, 0);
        }
        assert_eq!(sizes[SIZES_COUNT - 1], (1 << 16) * 8);
    }

    #[test]
    fn upper_and_lower_indices() {
        let sizes = size_classes();
        for (i, &s) in sizes.iter().enumerate() {
            assert_eq!(size_index_upper(s), i);
            assert_eq!(size_index_lower(s), i);
        }
        // a size between two classes rounds up / down respectively
        assert_eq!(size_index_upper(40), 4);
        assert_eq!(size_index_lower(40), 4);
        assert_eq!(size_classes()[4], 40);
        assert_eq!(size_index_upper(48), 5);
        assert_eq!(size_index_lower(44 + 4), 5);
    }

    #[test]
    fn allocate_and_free_roundtrip() {
        let (_buf, mm) = make_region(4096);
        unsafe {
            let a = mm_allocate(mm, 100);
            assert!(!a.is_null());
            assert_eq!(a as usize % 8, 0);
            assert!(mm_usable_size(a) >= 100);
            let b = mm_allocate(mm, 100);
            assert!(!b.is_null());
            assert_ne!(a, b);
            mm_free(mm, a);
            mm_free(mm, b);
            assert!(mm_leaked_blocks(mm).is_empty());
        }
    }

    #[test]
    fn exhaustion_returns_null() {
        let (_buf, mm) = make_region(2048);
        unsafe {
            assert!(mm_allocate(mm, 1 << 20).is_null());
        }
    }

    #[test]
    fn coalescing_restores_capacity() {
        let (_buf, mm) = make_region(16384);
        unsafe {
            // fill with 1 KiB blocks until exhaustion
            let mut ptrs = Vec::new();
            loop {
                let p = mm_allocate(mm, 1024);
                if p.is_null() {
                    break;
                }
                ptrs.push(p);
            }
            assert!(ptrs.len() >= 2);
            let count = ptrs.len();
            for p in ptrs {
                mm_free(mm, p);
            }
            assert!(mm_leaked_blocks(mm).is_empty());
            // after coalescing, the same number of blocks fits again
            let mut ptrs = Vec::new();
            for _ in 0..count {
                let p = mm_allocate(mm, 1024);
                assert!(!p.is_null());
                ptrs.push(p);
            }
            for p in ptrs {
                mm_free(mm, p);
            }
        }
    }

    #[test]
    fn free_neighbours_are_merged() {
        let (_buf, mm) = make_region(8192);
        unsafe {
            let a = mm_allocate(mm, 512);
            let b = mm_allocate(mm, 512);
            let c = mm_allocate(mm, 512);
            // free in an order that exercises next- and prev-coalescing
            mm_free(mm, b);
            mm_free(mm, a);
            mm_free(mm, c);
            // a merged heap serves one allocation spanning all three blocks
            let big = mm_allocate(mm, 512 * 3);
            assert!(!big.is_null());
            mm_free(mm, big);
        }
    }

    #[test]
    fn leak_walk_reports_offsets_and_sizes() {
        let (_buf, mm) = make_region(4096);
        unsafe {
            let a = mm_allocate(mm, 64);
            let leaks = mm_leaked_blocks(mm);
            assert_eq!(leaks.len(), 1);
            assert_eq!(leaks[0].size, mm_usable_size(a));
            assert_eq!(
                leaks[0].offset,
                a as usize - ALLOC_NODE_SIZE - mm as usize
            );
            mm_free(mm, a);
            assert!(mm_leaked_blocks(mm).is_empty());
        }
    }

    #[test]
    fn fuzz_allocate_free() {
        // deterministic exercise of split/coalesce across many interleavings
        let (_buf, mm) = make_region(1 << 16);
        let mut live: Vec<(*mut u8, u8)> = Vec::new();
        let mut seed = 0x9e3779b97f4a7c15u64;
        let mut next = || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        unsafe {
            for _ in 0..10_000 {
                let r = next();
                if r % 3 != 0 || live.is_empty() {
                    let size = (r % 700 + 1) as usize;
                    let p = mm_allocate(mm, size);
                    if !p.is_null() {
                        let tag = (r >> 32) as u8;
                        ptr::write_bytes(p, tag, size);
                        live.push((p, tag));
                    }
                } else {
                    let idx = (r as usize / 3) % live.len();
                    let (p, tag) = live.swap_remove(idx);
                    // contents were never touched by neighbouring operations
                    assert_eq!(*p, tag);
                    mm_free(mm, p);
                }
            }
            for (p, _) in live {
                mm_free(mm, p);
            }
            assert!(mm_leaked_blocks(mm).is_empty());
        }
    }
}
