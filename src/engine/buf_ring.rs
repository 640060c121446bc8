//! Registered provided-buffer ring for the multishot engine.
//!
//! The kernel selects a buffer from the ring for each arriving message
//! (kernel 5.19+), so receives need no per-operation buffer. Each buffer
//! index is either published in the ring or borrowed by the application
//! between completion and recycle; a completion that selected buffer `bid`
//! must recycle `bid` exactly once.

use io_uring::types::BufRingEntry;
use io_uring::IoUring;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};

/// Buffer group id shared by every multishot recv submission.
pub const BGID: u16 = 0;

pub struct BufRing {
    entries_ptr: *mut BufRingEntry,
    buffers_ptr: *mut u8,
    entries_layout: Layout,
    buffers_layout: Layout,
    entry_count: u16,
    buffer_size: usize,
    /// Tail including entries not yet published to the kernel.
    local_tail: u16,
    bgid: u16,
}

impl BufRing {
    /// Allocate, populate, and register a ring of `entry_count` buffers of
    /// `buffer_size` bytes each. `entry_count` must be a power of two.
    pub fn new(
        ring: &IoUring,
        entry_count: u16,
        buffer_size: usize,
        bgid: u16,
    ) -> io::Result<Self> {
        if !entry_count.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "buffer count must be a power of two",
            ));
        }

        let page = page_size();
        let entries_size = std::mem::size_of::<BufRingEntry>() * entry_count as usize;
        let entries_layout = Layout::from_size_align(entries_size, page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let buffers_layout = Layout::from_size_align(buffer_size * entry_count as usize, page)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let entries_ptr = unsafe { alloc_zeroed(entries_layout) as *mut BufRingEntry };
        if entries_ptr.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate ring entries",
            ));
        }

        let buffers_ptr = unsafe { alloc_zeroed(buffers_layout) };
        if buffers_ptr.is_null() {
            unsafe { dealloc(entries_ptr as *mut u8, entries_layout) };
            return Err(io::Error::new(
                io::ErrorKind::OutOfMemory,
                "failed to allocate buffers",
            ));
        }

        let mut pool = Self {
            entries_ptr,
            buffers_ptr,
            entries_layout,
            buffers_layout,
            entry_count,
            buffer_size,
            local_tail: 0,
            bgid,
        };

        // Publish every buffer before the kernel sees the ring.
        for bid in 0..entry_count {
            pool.push(bid);
        }
        pool.publish();

        // SAFETY: the entry array is page-aligned, zero-initialized, and
        // stays alive until Drop; unregistration happens before then.
        unsafe {
            ring.submitter()
                .register_buf_ring(entries_ptr as u64, entry_count, bgid)?;
        }

        Ok(pool)
    }

    #[inline]
    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    /// The first `len` bytes the kernel wrote into buffer `bid`, capped at
    /// the buffer stride.
    pub fn buffer(&self, bid: u16, len: usize) -> &[u8] {
        assert!(bid < self.entry_count, "buffer id out of range");
        let len = len.min(self.buffer_size);
        unsafe {
            std::slice::from_raw_parts(
                self.buffers_ptr.add(bid as usize * self.buffer_size),
                len,
            )
        }
    }

    /// Return buffer `bid` to the ring and publish the new tail. Must be
    /// called exactly once per completion that selected `bid`.
    pub fn recycle(&mut self, bid: u16) {
        self.push(bid);
        self.publish();
    }

    /// Unregister the ring from the kernel. Callers do this on every engine
    /// exit path before the ring memory is freed by Drop.
    pub fn unregister(&self, ring: &IoUring) -> io::Result<()> {
        ring.submitter().unregister_buf_ring(self.bgid)
    }

    fn push(&mut self, bid: u16) {
        let idx = (self.local_tail & (self.entry_count - 1)) as usize;
        // SAFETY: idx is masked into the entry array.
        unsafe {
            let entry = &mut *self.entries_ptr.add(idx);
            entry.set_addr(self.buffers_ptr.add(bid as usize * self.buffer_size) as u64);
            entry.set_len(self.buffer_size as u32);
            entry.set_bid(bid);
        }
        self.local_tail = self.local_tail.wrapping_add(1);
    }

    /// Release-store the tail the kernel reads.
    fn publish(&self) {
        // SAFETY: entries_ptr is the base of the shared ring.
        let tail = unsafe { BufRingEntry::tail(self.entries_ptr) } as *const AtomicU16;
        unsafe { (*tail).store(self.local_tail, Ordering::Release) };
    }
}

impl Drop for BufRing {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.buffers_ptr, self.buffers_layout);
            dealloc(self.entries_ptr as *mut u8, self.entries_layout);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf with a valid name has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}
