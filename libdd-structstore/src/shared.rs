// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Named shared-memory segments and their publication protocol.
//!
//! A segment rendezvous is a POSIX shared memory object (or a regular file
//! when file backing is selected). The permission bits double as the
//! readiness flag: the creator reserves the name with mode `0600`, builds
//! the [`SharedData`] header in place and only then publishes with `fchmod`
//! to `0660`. Attachers finding `0600` fail with [`Error::NotReady`] and may
//! retry; attachers finding `0660` map the recorded size and increment the
//! usage count.
//!
//! ```text
//! RESERVED(0600) -- creator writes header --> READY(0660) -- invalidated --> RETIRED(unlinked)
//! ```
//!
//! A READY segment is never re-entered: republishing goes through
//! invalidation, unlink and a fresh reservation (`reinit`), and late holders
//! notice through [`StructStoreShared::valid`] and recover through
//! [`StructStoreShared::revalidate`].

use crate::error::{Error, Result};
use crate::store::StructStore;
use crate::typing::FieldType;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use libc::{c_void, off_t};
use libdd_structstore_alloc::{OffsetPtr, SharedAlloc};
use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;
use tracing::{debug, warn};

/// What `close` does with the backing object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CleanupMode {
    /// Leave the segment alone.
    Never,
    /// Retire the segment when the last user closes.
    #[default]
    IfLast,
    /// Retire the segment on this close, regardless of other users.
    Always,
}

/// Region header at offset 0 of every mapping. Instances live in shared
/// memory; nothing in here may hold an absolute pointer.
#[repr(C)]
struct SharedData {
    size: usize,
    usage_count: AtomicI32,
    alloc: SharedAlloc,
    root: OffsetPtr<StructStore>,
    invalidated: AtomicBool,
}

const _: () = assert!(mem::size_of::<SharedData>() % 8 == 0);

impl SharedData {
    /// Builds the header, the embedded allocator and the root store inside a
    /// zeroed mapping.
    ///
    /// # Safety
    /// `this` points to a fresh zeroed mapping of `total` bytes, with
    /// `total == size_of::<SharedData>() + bufsize`.
    unsafe fn init(this: *mut SharedData, total: usize, bufsize: usize) -> Result<()> {
        (*this).size = total;
        ptr::write(ptr::addr_of_mut!((*this).usage_count), AtomicI32::new(1));
        let buffer = (this as *mut u8).add(mem::size_of::<SharedData>());
        SharedAlloc::init(ptr::addr_of_mut!((*this).alloc), buffer, bufsize)?;
        ptr::write(ptr::addr_of_mut!((*this).root), OffsetPtr::null());
        let store = (*this).alloc.allocate_one::<StructStore>()?;
        StructStore::init(store.as_ptr(), &(*this).alloc, true, None);
        (*this).root.set(store.as_ptr());
        ptr::write(ptr::addr_of_mut!((*this).invalidated), AtomicBool::new(false));
        Ok(())
    }
}

/// Options for [`StructStoreShared::open_with`].
#[derive(Clone, Debug)]
pub struct OpenOptions {
    bufsize: usize,
    reinit: bool,
    use_file: bool,
    cleanup: CleanupMode,
}

impl Default for OpenOptions {
    fn default() -> Self {
        OpenOptions {
            bufsize: 4096,
            reinit: false,
            use_file: false,
            cleanup: CleanupMode::IfLast,
        }
    }
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Size of the managed heap behind the header (default 4096).
    pub fn bufsize(mut self, bufsize: usize) -> Self {
        self.bufsize = bufsize;
        self
    }

    /// Invalidate and replace an existing segment instead of attaching.
    pub fn reinit(mut self, reinit: bool) -> Self {
        self.reinit = reinit;
        self
    }

    /// Back the segment with a regular file instead of POSIX shared memory.
    pub fn use_file(mut self, use_file: bool) -> Self {
        self.use_file = use_file;
        self
    }

    pub fn cleanup(mut self, cleanup: CleanupMode) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn open(&self, path: &str) -> Result<StructStoreShared> {
        StructStoreShared::open_with(path, self)
    }
}

fn open_excl(path: &CStr, use_file: bool) -> Option<OwnedFd> {
    let flags = libc::O_EXCL | libc::O_CREAT | libc::O_RDWR;
    let fd = unsafe {
        if use_file {
            libc::open(path.as_ptr(), flags, 0o600 as libc::c_uint)
        } else {
            libc::shm_open(path.as_ptr(), flags, 0o600)
        }
    };
    if fd == -1 {
        None
    } else {
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn open_existing(path: &CStr, use_file: bool) -> io::Result<OwnedFd> {
    let fd = unsafe {
        if use_file {
            libc::open(path.as_ptr(), libc::O_RDWR)
        } else {
            libc::shm_open(path.as_ptr(), libc::O_RDWR, 0)
        }
    };
    if fd == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn fstat_fd(fd: RawFd) -> Result<(u32, i64)> {
    let mut st: libc::stat = unsafe { mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok((st.st_mode as u32, st.st_size as i64))
}

fn unlink_object(path: &CStr, use_file: bool) {
    unsafe {
        if use_file {
            libc::unlink(path.as_ptr());
        } else {
            libc::shm_unlink(path.as_ptr());
        }
    }
}

unsafe fn map_region(fd: RawFd, size: usize) -> Result<*mut SharedData> {
    let p = libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        0,
    );
    if p == libc::MAP_FAILED {
        return Err(io::Error::last_os_error().into());
    }
    Ok(p as *mut SharedData)
}

const MODE_RESERVED: u32 = libc::S_IFREG | 0o600;
const MODE_READY: u32 = libc::S_IFREG | 0o660;

/// Handle on a named shared store: one mapping of the segment plus the
/// cleanup policy this handle closes with.
pub struct StructStoreShared {
    path: Option<CString>,
    fd: Option<OwnedFd>,
    data: *mut SharedData,
    use_file: bool,
    cleanup: CleanupMode,
}

// SAFETY: the mapping is shared state guarded by the region's own locks; the
// handle itself is plain data.
unsafe impl Send for StructStoreShared {}

impl StructStoreShared {
    /// Opens (creating or attaching) the named segment with default options.
    pub fn open(path: &str) -> Result<StructStoreShared> {
        Self::open_with(path, &OpenOptions::default())
    }

    pub fn open_with(path: &str, opts: &OpenOptions) -> Result<StructStoreShared> {
        let cpath = CString::new(path)
            .map_err(|_| Error::Io(io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL")))?;

        let mut created = true;
        let mut fd = match open_excl(&cpath, opts.use_file) {
            Some(fd) => fd,
            None => {
                created = false;
                open_existing(&cpath, opts.use_file)?
            }
        };

        let (mode, fsize) = fstat_fd(fd.as_raw_fd())?;

        if opts.reinit && fsize != 0 {
            // an old segment exists: mark it retired, unlink, recreate
            let old = Self::map_existing(fd.as_raw_fd())?;
            unsafe {
                (*old).invalidated.store(true, Ordering::SeqCst);
                (*old).usage_count.fetch_sub(1, Ordering::SeqCst);
                let size = (*old).size;
                libc::munmap(old as *mut c_void, size);
            }
            drop(fd);
            unlink_object(&cpath, opts.use_file);
            fd = open_excl(&cpath, opts.use_file)
                .ok_or_else(|| Error::Io(io::Error::last_os_error()))?;
            created = true;
        } else if !created && mode == MODE_RESERVED {
            return Err(Error::NotReady);
        } else if !created && mode != MODE_READY {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared segment in unexpected state",
            )));
        }

        let data = if created {
            let total = mem::size_of::<SharedData>() + opts.bufsize;
            if unsafe { libc::ftruncate(fd.as_raw_fd(), total as off_t) } < 0 {
                let e = io::Error::last_os_error();
                unlink_object(&cpath, opts.use_file);
                return Err(e.into());
            }
            let data = unsafe { map_region(fd.as_raw_fd(), total)? };
            unsafe {
                ptr::write_bytes(data as *mut u8, 0, total);
                if let Err(e) = SharedData::init(data, total, opts.bufsize) {
                    libc::munmap(data as *mut c_void, total);
                    unlink_object(&cpath, opts.use_file);
                    return Err(e);
                }
            }
            // publish: the header is complete, let attachers in
            if unsafe { libc::fchmod(fd.as_raw_fd(), 0o660) } != 0 {
                return Err(io::Error::last_os_error().into());
            }
            debug!(path, total, "created shared store");
            data
        } else {
            let data = Self::map_existing(fd.as_raw_fd())?;
            debug!(path, "attached shared store");
            data
        };

        Ok(StructStoreShared {
            path: Some(cpath),
            fd: Some(fd),
            data,
            use_file: opts.use_file,
            cleanup: opts.cleanup,
        })
    }

    /// Attaches through an already-open descriptor, e.g. one received over a
    /// Unix socket. With `init` the segment is built in place (the fd must
    /// already have its final size); otherwise the existing header is
    /// mapped and the usage count incremented.
    pub fn from_fd(fd: OwnedFd, init: bool) -> Result<StructStoreShared> {
        let (_, fsize) = fstat_fd(fd.as_raw_fd())?;
        let size = fsize as usize;
        if size < mem::size_of::<SharedData>() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "descriptor does not hold a shared store",
            )));
        }
        let data = if init {
            let bufsize = size - mem::size_of::<SharedData>();
            let data = unsafe { map_region(fd.as_raw_fd(), size)? };
            unsafe {
                ptr::write_bytes(data as *mut u8, 0, size);
                if let Err(e) = SharedData::init(data, size, bufsize) {
                    libc::munmap(data as *mut c_void, size);
                    return Err(e);
                }
            }
            data
        } else {
            Self::map_existing(fd.as_raw_fd())?
        };
        Ok(StructStoreShared {
            path: None,
            fd: Some(fd),
            data,
            use_file: false,
            cleanup: CleanupMode::Never,
        })
    }

    fn map_existing(fd: RawFd) -> Result<*mut SharedData> {
        // the leading size word records how much to map
        let mut size: usize = 0;
        let n = unsafe {
            libc::pread(
                fd,
                &mut size as *mut usize as *mut c_void,
                mem::size_of::<usize>(),
                0,
            )
        };
        if n != mem::size_of::<usize>() as isize {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "reading segment size failed",
            )));
        }
        if size < mem::size_of::<SharedData>() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "segment size is invalid",
            )));
        }
        let data = unsafe { map_region(fd, size)? };
        unsafe { (*data).usage_count.fetch_add(1, Ordering::SeqCst) };
        Ok(data)
    }

    /// True while this handle is mapped and the segment has not been
    /// invalidated.
    pub fn valid(&self) -> bool {
        !self.data.is_null() && !unsafe { (*self.data).invalidated.load(Ordering::Acquire) }
    }

    fn data_ref(&self) -> Result<&SharedData> {
        if self.data.is_null() {
            return Err(Error::SegmentInvalidated);
        }
        Ok(unsafe { &*self.data })
    }

    /// The root store of the mapped segment.
    pub fn store(&self) -> Result<&StructStore> {
        let data = self.data_ref()?;
        unsafe { data.root.as_ref() }.ok_or(Error::SegmentInvalidated)
    }

    pub fn store_mut(&mut self) -> Result<&mut StructStore> {
        let data = self.data_ref()?;
        unsafe { data.root.as_mut() }.ok_or(Error::SegmentInvalidated)
    }

    /// Base address of the mapping.
    pub fn addr(&self) -> Result<*const u8> {
        Ok(self.data_ref()? as *const SharedData as *const u8)
    }

    /// Total mapped size, header included.
    pub fn size(&self) -> Result<usize> {
        Ok(self.data_ref()?.size)
    }

    /// Current number of attached handles.
    pub fn usage_count(&self) -> Result<i32> {
        Ok(self.data_ref()?.usage_count.load(Ordering::SeqCst))
    }

    /// Deep equality of the two root stores.
    pub fn equals(&self, other: &StructStoreShared) -> Result<bool> {
        self.store()?.equals(other.store()?)
    }

    /// Deep invariant audit of the mapped region.
    pub fn check(&self) -> Result<()> {
        self.store()?.check()
    }

    /// After invalidation, attaches to the segment republished under the
    /// same name. Blocking mode busy-sleeps about a millisecond per probe
    /// until the new segment is ready.
    pub fn revalidate(&mut self, block: bool) -> Result<bool> {
        self.revalidate_interruptible(block, || false)
    }

    /// Like [`revalidate`](Self::revalidate), polling `cancelled` between
    /// probes so a host can interrupt the wait.
    pub fn revalidate_interruptible(
        &mut self,
        block: bool,
        mut cancelled: impl FnMut() -> bool,
    ) -> Result<bool> {
        if self.valid() {
            return Ok(true);
        }
        let Some(path) = self.path.clone() else {
            return Ok(false);
        };
        loop {
            if let Ok(fd) = open_existing(&path, self.use_file) {
                let (mode, _) = fstat_fd(fd.as_raw_fd())?;
                if mode == MODE_READY {
                    // unmap as late as possible: until here, readers going
                    // through the old mapping must not crash mid-operation
                    if !self.data.is_null() {
                        unsafe {
                            let size = (*self.data).size;
                            libc::munmap(self.data as *mut c_void, size);
                        }
                        self.data = ptr::null_mut();
                    }
                    self.data = Self::map_existing(fd.as_raw_fd())?;
                    self.fd = Some(fd);
                    return Ok(true);
                }
            }
            if !block || cancelled() {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Snapshot of the whole region.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let data = self.data_ref()?;
        let bytes =
            unsafe { core::slice::from_raw_parts(self.data as *const u8, data.size) };
        Ok(bytes.to_vec())
    }

    /// Restores a snapshot taken from a mapping of the same size.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let own_size = self.data_ref()?.size;
        if bytes.len() < mem::size_of::<usize>() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot too small",
            )));
        }
        let mut src_size = [0u8; mem::size_of::<usize>()];
        src_size.copy_from_slice(&bytes[..mem::size_of::<usize>()]);
        let src_size = usize::from_ne_bytes(src_size);
        if bytes.len() < src_size || src_size > own_size {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "snapshot does not fit this segment",
            )));
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.data as *mut u8, src_size) };
        Ok(())
    }

    /// Detaches from the segment, retiring it according to the cleanup
    /// policy. Retirement destroys the root store, tears down the region
    /// allocator (reporting leaked blocks) and unlinks the backing object.
    pub fn close(&mut self) -> Result<()> {
        if self.data.is_null() {
            return Ok(());
        }
        let data = self.data;
        let mut result = Ok(());
        unsafe {
            let remaining = (*data).usage_count.fetch_sub(1, Ordering::SeqCst) - 1;
            let retire = (remaining == 0 && self.cleanup == CleanupMode::IfLast)
                || self.cleanup == CleanupMode::Always;
            if retire
                && (*data)
                    .invalidated
                    .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let root = (*data).root.get();
                if !root.is_null() {
                    StructStore::destroy_at(&(*data).alloc, root);
                    (*data).alloc.deallocate(root as *mut u8);
                    (*data).root.set(ptr::null());
                }
                result = SharedAlloc::dispose(ptr::addr_of_mut!((*data).alloc)).map_err(Error::from);
                if let Some(path) = &self.path {
                    unlink_object(path, self.use_file);
                }
            }
            let size = (*data).size;
            libc::munmap(data as *mut c_void, size);
        }
        self.data = ptr::null_mut();
        self.fd = None;
        result
    }
}

impl Drop for StructStoreShared {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "closing shared store");
        }
    }
}
