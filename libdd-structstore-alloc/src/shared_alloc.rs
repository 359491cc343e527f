// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Region allocator facade.
//!
//! [`SharedAlloc`] wraps the raw [`mini_malloc`](crate::mini_malloc) heap
//! with a reentrant write lock, an allocated-bytes counter, the region's
//! string interning table and an [`Allocator`] implementation so
//! allocator-parameterised containers can be backed by a region.
//!
//! The header is constructed in place (it usually sits inside a shared
//! memory mapping, directly in front of the buffer it manages) and torn down
//! explicitly through [`SharedAlloc::dispose`], which verifies that no
//! allocation outlived its container.

use crate::error::{Error, Result};
use crate::lock::SpinMutex;
use crate::mini_malloc::{
    init_mini_malloc, mm_allocate, mm_free, mm_leaked_blocks, mm_usable_size, MiniMalloc,
};
use crate::offset_ptr::OffsetPtr;
use crate::strings::StringStorage;
use allocator_api2::alloc::{AllocError, Allocator};
use core::alloc::Layout;
use core::cell::Cell;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use once_cell::sync::Lazy;
use tracing::error;

pub use crate::mini_malloc::ALIGN;

#[repr(C)]
pub struct SharedAlloc {
    mutex: SpinMutex,
    blocksize: u32,
    allocated: Cell<usize>,
    mm: OffsetPtr<MiniMalloc>,
    strings: OffsetPtr<StringStorage>,
}

// SAFETY: `allocated` is only written under the write lock; everything else
// is either atomic or immutable after init.
unsafe impl Send for SharedAlloc {}
unsafe impl Sync for SharedAlloc {}

impl SharedAlloc {
    /// Constructs an allocator header at `this`, managing `size` bytes at
    /// `buffer`, and seeds the interning table inside the managed heap.
    ///
    /// # Safety
    /// `this` must point to writable memory for the header; `buffer` must
    /// point to `size` bytes of writable, 8-aligned memory disjoint from the
    /// header. `size` must be below 2^31.
    pub unsafe fn init(this: *mut SharedAlloc, buffer: *mut u8, size: usize) -> Result<()> {
        debug_assert!(size < (1usize << 31));
        debug_assert_eq!(buffer as usize % ALIGN, 0);
        // room for the heap header, one minimal block and the sentinel
        let min_size = mem::size_of::<MiniMalloc>() + 4 * ALIGN;
        if size < min_size {
            return Err(Error::OutOfRegionMemory {
                allocated: 0,
                requested: size,
            });
        }
        ptr::write(ptr::addr_of_mut!((*this).mutex), SpinMutex::new());
        (*this).blocksize = size as u32;
        ptr::write(ptr::addr_of_mut!((*this).allocated), Cell::new(0));
        ptr::write(ptr::addr_of_mut!((*this).mm), OffsetPtr::null());
        ptr::write(ptr::addr_of_mut!((*this).strings), OffsetPtr::null());
        (*this).mm.set(buffer as *mut MiniMalloc);
        init_mini_malloc(buffer as *mut MiniMalloc, size);

        let storage = (*this).allocate(mem::size_of::<StringStorage>())?.as_ptr()
            as *mut StringStorage;
        StringStorage::init(storage, &*this)?;
        (*this).strings.set(storage);
        Ok(())
    }

    /// Returns an 8-aligned block of at least `size` bytes. A zero-size
    /// request is bumped to one allocation unit.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let size = if size == 0 { ALIGN } else { size };
        let guard = self.mutex.write_lock();
        // SAFETY: the write lock serializes every heap mutation.
        let p = unsafe { mm_allocate(self.mm.get(), size) };
        let result = match NonNull::new(p) {
            Some(nn) => {
                let block = unsafe { mm_usable_size(nn.as_ptr()) } as usize;
                self.allocated.set(self.allocated.get() + block);
                Ok(nn)
            }
            None => Err(Error::OutOfRegionMemory {
                allocated: self.allocated.get(),
                requested: size,
            }),
        };
        guard.unlock();
        result
    }

    /// Uninitialized storage for one `T`.
    pub fn allocate_one<T>(&self) -> Result<NonNull<T>> {
        debug_assert!(mem::align_of::<T>() <= ALIGN);
        Ok(self.allocate(mem::size_of::<T>())?.cast())
    }

    /// Returns a block to the heap. Passing null is a no-op.
    pub fn deallocate(&self, p: *mut u8) {
        if p.is_null() {
            return;
        }
        let guard = self.mutex.write_lock();
        // SAFETY: the write lock serializes every heap mutation.
        unsafe {
            let block = mm_usable_size(p) as usize;
            self.allocated.set(self.allocated.get() - block);
            mm_free(self.mm.get(), p);
        }
        guard.unlock();
    }

    /// Size of the managed buffer in bytes.
    pub fn size(&self) -> usize {
        self.blocksize as usize
    }

    /// Bytes currently allocated, including block quantization.
    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    /// True iff `p` lies within the managed buffer.
    pub fn is_owned<T>(&self, p: *const T) -> bool {
        let buffer = self.mm.get() as usize;
        let addr = p as usize;
        !p.is_null() && addr >= buffer && addr < buffer + self.blocksize as usize
    }

    pub fn assert_owned<T>(&self, p: *const T) -> Result<()> {
        if self.is_owned(p) {
            Ok(())
        } else {
            Err(Error::InvalidPointer { addr: p as usize })
        }
    }

    /// The region's string interning table.
    pub fn strings(&self) -> &StringStorage {
        // SAFETY: set once during init, valid for the region's lifetime.
        unsafe { &*self.strings.get() }
    }

    /// Tears down the interning table and verifies that nothing else is
    /// still allocated. The region must not be used afterwards.
    ///
    /// # Safety
    /// All containers in the region must already be destroyed and no other
    /// thread or process may touch the region concurrently.
    pub unsafe fn dispose(this: *mut SharedAlloc) -> Result<()> {
        let storage = (*this).strings.get();
        if !storage.is_null() {
            (*storage).dispose(&*this);
            (*this).deallocate(storage as *mut u8);
            (*this).strings.set(ptr::null());
        }
        let leaks = mm_leaked_blocks((*this).mm.get());
        if !leaks.is_empty() {
            for leak in &leaks {
                error!(offset = leak.offset, size = leak.size, "leaked region block");
            }
            return Err(Error::LeakedBlocks(leaks));
        }
        Ok(())
    }
}

// The typed-allocator bridge: region-backed containers parameterised over
// `Allocator` can use a `&SharedAlloc` directly. Alignment above 8 is not
// representable in this heap.
unsafe impl Allocator for SharedAlloc {
    fn allocate(&self, layout: Layout) -> std::result::Result<NonNull<[u8]>, AllocError> {
        if layout.align() > ALIGN {
            return Err(AllocError);
        }
        match SharedAlloc::allocate(self, layout.size()) {
            Ok(p) => Ok(NonNull::slice_from_raw_parts(p, layout.size())),
            Err(_) => Err(AllocError),
        }
    }

    unsafe fn deallocate(&self, p: NonNull<u8>, _layout: Layout) {
        SharedAlloc::deallocate(self, p.as_ptr());
    }
}

const STATIC_ALLOC_SIZE: usize = 1 << 20;

/// Process-local allocator backing stores that do not live in shared memory.
/// Lives for the whole process and is intentionally never torn down; it must
/// never be referenced from within a shared region.
pub fn static_alloc() -> &'static SharedAlloc {
    struct Holder(*mut SharedAlloc);
    // SAFETY: the pointee is a process-global SharedAlloc, which is Sync.
    unsafe impl Send for Holder {}
    unsafe impl Sync for Holder {}

    static STATIC_ALLOC: Lazy<Holder> = Lazy::new(|| {
        let header = (mem::size_of::<SharedAlloc>() + ALIGN - 1) & !(ALIGN - 1);
        let layout = Layout::from_size_align(header + STATIC_ALLOC_SIZE, ALIGN)
            .expect("static allocator layout");
        // SAFETY: fresh zeroed heap memory, laid out as [header][buffer].
        unsafe {
            let base = std::alloc::alloc_zeroed(layout);
            assert!(!base.is_null(), "static allocator heap allocation failed");
            let this = base as *mut SharedAlloc;
            SharedAlloc::init(this, base.add(header), STATIC_ALLOC_SIZE)
                .expect("static allocator init");
            Holder(this)
        }
    });
    unsafe { &*STATIC_ALLOC.0 }
}
