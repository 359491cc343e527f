// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reentrant reader-writer spin lock.
//!
//! One `i32` of state: `> 0` is the shared reader count, `0` is unlocked,
//! `< 0` is the nested write count of the owning thread. A random 32-bit
//! per-thread identity is stamped into the lock while write-held so nested
//! writes from the same logical thread are recognised; the identity is random
//! rather than an OS thread id so it stays unambiguous across the processes
//! sharing a region.
//!
//! There is no blocking primitive anywhere: acquisition spins on relaxed
//! loads and a CAS on the state transition, like the spinlock guarding the
//! shared string table in the profiling SHM code.

use core::hint;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::error::Error;

thread_local! {
    static LOCK_TID: u32 = {
        // zero is the "no writer" sentinel
        let mut tid = rand::random::<u32>();
        while tid == 0 {
            tid = rand::random::<u32>();
        }
        tid
    };
}

fn current_tid() -> u32 {
    LOCK_TID.with(|t| *t)
}

#[derive(Debug, Default)]
pub struct SpinMutex {
    // >0 read-locked, 0 unlocked, <0 write-locked
    level: AtomicI32,
    // thread identity currently holding the write lock, or zero
    write_lock_tid: AtomicU32,
}

impl SpinMutex {
    /// The all-zeroes state is unlocked, so a freshly zeroed region slot is a
    /// valid mutex.
    pub const fn new() -> Self {
        SpinMutex {
            level: AtomicI32::new(0),
            write_lock_tid: AtomicU32::new(0),
        }
    }

    /// Acquires the lock shared. Fails with [`Error::LockRecursion`] if the
    /// current thread already holds the write lock.
    pub fn read_lock(&self) -> Result<ReadGuard<'_>, Error> {
        if self.write_lock_tid.load(Ordering::Relaxed) == current_tid() {
            return Err(Error::LockRecursion);
        }
        loop {
            let v = self.level.load(Ordering::Relaxed);
            if v < 0 {
                hint::spin_loop();
                continue;
            }
            if self
                .level
                .compare_exchange_weak(v, v + 1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        Ok(ReadGuard { mutex: Some(self) })
    }

    /// Acquires the lock exclusive. Nested acquisition from the thread that
    /// already holds the write lock succeeds and composes with its release.
    pub fn write_lock(&self) -> WriteGuard<'_> {
        let tid = current_tid();
        if self.write_lock_tid.load(Ordering::Relaxed) == tid {
            // nested write from the owning thread
            let v = self.level.load(Ordering::Relaxed);
            debug_assert!(v < 0);
            self.level.store(v - 1, Ordering::Relaxed);
            return WriteGuard { mutex: Some(self) };
        }
        loop {
            match self
                .level
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(_) => hint::spin_loop(),
            }
        }
        debug_assert_eq!(self.write_lock_tid.load(Ordering::Relaxed), 0);
        self.write_lock_tid.store(tid, Ordering::Relaxed);
        WriteGuard { mutex: Some(self) }
    }

    fn read_unlock(&self) {
        let prev = self.level.fetch_sub(1, Ordering::Release);
        debug_assert!(prev > 0);
    }

    fn write_unlock(&self) {
        // only the owning thread mutates a negative level, so plain
        // load/store is enough here
        let v = self.level.load(Ordering::Relaxed);
        debug_assert!(v < 0);
        if v + 1 == 0 {
            self.write_lock_tid.store(0, Ordering::Relaxed);
        }
        self.level.store(v + 1, Ordering::Release);
    }
}

/// Shared guard; releases on drop, or earlier via [`unlock`](ReadGuard::unlock).
#[must_use]
pub struct ReadGuard<'a> {
    mutex: Option<&'a SpinMutex>,
}

impl ReadGuard<'_> {
    pub fn unlock(mut self) {
        if let Some(m) = self.mutex.take() {
            m.read_unlock();
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.mutex.take() {
            m.read_unlock();
        }
    }
}

/// Exclusive guard; releases on drop, or earlier via [`unlock`](WriteGuard::unlock).
#[must_use]
pub struct WriteGuard<'a> {
    mutex: Option<&'a SpinMutex>,
}

impl WriteGuard<'_> {
    pub fn unlock(mut self) {
        if let Some(m) = self.mutex.take() {
            m.write_unlock();
        }
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if let Some(m) = self.mutex.take() {
            m.write_unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn read_then_write() {
        let m = SpinMutex::new();
        {
            let g1 = m.read_lock().unwrap();
            let g2 = m.read_lock().unwrap();
            g1.unlock();
            g2.unlock();
        }
        let w = m.write_lock();
        w.unlock();
    }

    #[test]
    fn nested_writes_compose() {
        let m = SpinMutex::new();
        let outer = m.write_lock();
        let inner = m.write_lock();
        inner.unlock();
        outer.unlock();
        // lock is fully released again
        let r = m.read_lock().unwrap();
        r.unlock();
    }

    #[test]
    fn read_while_write_held_fails() {
        let m = SpinMutex::new();
        let w = m.write_lock();
        assert!(matches!(m.read_lock(), Err(Error::LockRecursion)));
        w.unlock();
        assert!(m.read_lock().is_ok());
    }

    #[test]
    fn writers_exclude_each_other() {
        let m = Arc::new(SpinMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let g = m.write_lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    g.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }
}
