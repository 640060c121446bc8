//! Pending-operation table for the completion engines.
//!
//! Every io_uring submission is tagged with a slab key carried as the
//! completion's user_data. The record owns whatever must survive the
//! submission: the target descriptor and, for single-shot reads and all
//! sends, the heap buffer. Multishot records stay in the table until the
//! terminating completion.

use slab::Slab;
use std::os::unix::io::RawFd;

/// An in-flight operation.
#[derive(Debug)]
pub enum PendingOp {
    /// Accept on the listener. A multishot accept reuses this record for
    /// every completion.
    Accept,
    /// Receive on a connection. `buf` is present for single-shot reads and
    /// absent when the kernel selects from a provided buffer ring.
    Recv {
        fd: RawFd,
        buf: Option<Box<[u8]>>,
    },
    /// Send on a connection. Owns the bytes until the completion arrives.
    Send {
        fd: RawFd,
        buf: Box<[u8]>,
        len: usize,
    },
}

/// Slab of in-flight operations keyed by the io_uring user_data handle.
pub struct OpTable {
    ops: Slab<PendingOp>,
}

impl OpTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ops: Slab::with_capacity(capacity),
        }
    }

    /// Insert a record, returning the handle to stamp on the submission.
    pub fn insert(&mut self, op: PendingOp) -> u64 {
        self.ops.insert(op) as u64
    }

    /// Look up a live record. Returns None for handles the kernel invented
    /// or that were already freed; callers log and skip those.
    pub fn get(&self, token: u64) -> Option<&PendingOp> {
        self.ops.get(token as usize)
    }

    /// Free a record, returning ownership of its buffer and descriptor.
    pub fn remove(&mut self, token: u64) -> Option<PendingOp> {
        let idx = token as usize;
        if self.ops.contains(idx) {
            Some(self.ops.remove(idx))
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Teardown: drop every record, closing each connection descriptor
    /// exactly once. A connection can be referenced by both a recv and a
    /// send record, so descriptors are deduplicated before closing.
    /// Returns the number of descriptors closed.
    pub fn drain_close(&mut self) -> u64 {
        let mut fds: Vec<RawFd> = Vec::with_capacity(self.ops.len());
        for op in self.ops.drain() {
            match op {
                PendingOp::Accept => {}
                PendingOp::Recv { fd, .. } | PendingOp::Send { fd, .. } => fds.push(fd),
            }
        }
        fds.sort_unstable();
        fds.dedup();
        for &fd in &fds {
            unsafe { libc::close(fd) };
        }
        fds.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut ops = OpTable::with_capacity(16);

        let t1 = ops.insert(PendingOp::Accept);
        let t2 = ops.insert(PendingOp::Recv { fd: 7, buf: None });
        assert_eq!(ops.len(), 2);

        assert!(matches!(ops.get(t1), Some(PendingOp::Accept)));
        assert!(matches!(ops.get(t2), Some(PendingOp::Recv { fd: 7, .. })));

        assert!(matches!(ops.remove(t1), Some(PendingOp::Accept)));
        assert!(ops.get(t1).is_none());
        assert_eq!(ops.len(), 1);

        // Freed slots are reused.
        let t3 = ops.insert(PendingOp::Accept);
        assert_eq!(t3, t1);
    }

    #[test]
    fn unknown_handle_is_tolerated() {
        let mut ops = OpTable::with_capacity(4);
        assert!(ops.get(99).is_none());
        assert!(ops.remove(99).is_none());
    }

    #[test]
    fn buffer_ownership_moves_with_record() {
        let mut ops = OpTable::with_capacity(4);
        let buf = vec![0u8; 4096].into_boxed_slice();
        let token = ops.insert(PendingOp::Recv { fd: 5, buf: Some(buf) });

        match ops.remove(token) {
            Some(PendingOp::Recv { fd: 5, buf: Some(buf) }) => assert_eq!(buf.len(), 4096),
            other => panic!("unexpected record: {other:?}"),
        }
        assert!(ops.is_empty());
    }

    #[test]
    fn drain_close_dedups_descriptors() {
        // Descriptors that are not open; drain_close must still count each
        // distinct fd once. close(2) on a bad fd is harmless here.
        let mut ops = OpTable::with_capacity(8);
        ops.insert(PendingOp::Accept);
        ops.insert(PendingOp::Recv { fd: -2, buf: None });
        ops.insert(PendingOp::Send {
            fd: -2,
            buf: vec![0u8; 8].into_boxed_slice(),
            len: 8,
        });
        ops.insert(PendingOp::Recv { fd: -3, buf: None });

        assert_eq!(ops.drain_close(), 2);
        assert!(ops.is_empty());
    }
}
