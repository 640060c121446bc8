//! Multishot completion engine with a provided buffer ring.
//!
//! One multishot accept covers the listener for the whole run; each
//! connection gets one multishot recv that selects buffers from the
//! registered pool. Received bytes are copied into a fresh heap buffer for
//! the async send and the pool buffer is recycled immediately, capping
//! pool residency at one loop iteration. A recv completion without the
//! MORE flag ends the connection, whatever the cause.

use crate::config::Config;
use crate::engine::buf_ring::{BufRing, BGID};
use crate::engine::op::{OpTable, PendingOp};
use crate::engine::{
    bind_listener, close_fd, push_entry, set_nodelay, submit_and_wait_bounded, submit_send,
};
use crate::metrics::Metrics;
use io_uring::{cqueue, opcode, types, IoUring};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn run(config: &Config, shutdown: &Arc<AtomicBool>) -> io::Result<Metrics> {
    let mut ring = IoUring::new(config.ring_size)?;
    let listener = bind_listener(config.port, false)?;
    let listener_fd = listener.as_raw_fd();

    let entry_count = u16::try_from(config.buffer_count)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "buffer count exceeds u16"))?;
    let mut pool = BufRing::new(&ring, entry_count, config.buffer_size, BGID)?;

    let mut ops = OpTable::with_capacity(config.ring_size as usize);
    let mut metrics = Metrics::new();

    let result = event_loop(
        shutdown,
        &mut ring,
        &mut ops,
        &mut pool,
        listener_fd,
        &mut metrics,
    );

    // Teardown runs whether the loop ended by flag or by error: close the
    // descriptors still held by records, then detach the registration
    // while the ring fd is still open, so the kernel never sees the pool
    // memory outlive its registration.
    metrics.conns_closed += ops.drain_close();
    if let Err(e) = pool.unregister(&ring) {
        warn!(error = %e, "failed to unregister buffer ring");
    }
    metrics.final_report();
    result.map(|_| metrics)
}

fn event_loop(
    shutdown: &Arc<AtomicBool>,
    ring: &mut IoUring,
    ops: &mut OpTable,
    pool: &mut BufRing,
    listener_fd: RawFd,
    metrics: &mut Metrics,
) -> io::Result<()> {
    // The accept record lives for the whole run; its identity is bound to
    // the multishot submission.
    let accept_token = ops.insert(PendingOp::Accept);
    submit_accept(ring, listener_fd, accept_token)?;
    ring.submit()?;

    while !shutdown.load(Ordering::Relaxed) {
        submit_and_wait_bounded(ring)?;

        loop {
            let cqe = match ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };

            dispatch(ring, ops, pool, listener_fd, &cqe, metrics)?;
            ring.submit()?;
        }

        metrics.report(false);
    }
    Ok(())
}

/// Record tag captured before the mutable dispatch, since multishot
/// records stay in the table across completions.
enum Tag {
    Accept,
    Recv(RawFd),
    Send,
}

fn dispatch(
    ring: &mut IoUring,
    ops: &mut OpTable,
    pool: &mut BufRing,
    listener_fd: RawFd,
    cqe: &cqueue::Entry,
    metrics: &mut Metrics,
) -> io::Result<()> {
    let token = cqe.user_data();
    let result = cqe.result();
    let flags = cqe.flags();
    let more = cqueue::more(flags);

    let tag = match ops.get(token) {
        None => {
            warn!(token, "completion for unknown operation");
            return Ok(());
        }
        Some(PendingOp::Accept) => Tag::Accept,
        Some(PendingOp::Recv { fd, .. }) => Tag::Recv(*fd),
        Some(PendingOp::Send { .. }) => Tag::Send,
    };

    match tag {
        Tag::Accept => handle_accept(result, more, ring, ops, pool, listener_fd, token, metrics),
        Tag::Recv(fd) => handle_recv(result, flags, more, ring, ops, pool, token, fd, metrics),
        Tag::Send => handle_send(result, ops, token),
    }
}

fn handle_accept(
    result: i32,
    more: bool,
    ring: &mut IoUring,
    ops: &mut OpTable,
    pool: &BufRing,
    listener_fd: RawFd,
    token: u64,
    metrics: &mut Metrics,
) -> io::Result<()> {
    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        warn!(error = %err, "accept failed");
    } else {
        let fd = result;
        if let Err(e) = set_nodelay(fd) {
            debug!(fd, error = %e, "TCP_NODELAY failed");
        }
        metrics.on_accept();
        debug!(fd, "accepted connection");

        let recv_token = ops.insert(PendingOp::Recv { fd, buf: None });
        let sqe = opcode::RecvMulti::new(types::Fd(fd), pool.bgid())
            .build()
            .user_data(recv_token);
        push_entry(ring, &sqe)?;
    }

    if !more {
        // Kernel dropped the multishot; re-arm with the same record.
        warn!("re-arming multishot accept");
        submit_accept(ring, listener_fd, token)?;
    }
    Ok(())
}

fn handle_recv(
    result: i32,
    flags: u32,
    more: bool,
    ring: &mut IoUring,
    ops: &mut OpTable,
    pool: &mut BufRing,
    token: u64,
    fd: RawFd,
    metrics: &mut Metrics,
) -> io::Result<()> {
    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        if -result == libc::ENOBUFS {
            warn!(fd, "recv: provided buffer pool exhausted");
        } else {
            debug!(fd, error = %err, "recv failed");
        }
    } else if result > 0 {
        let n = result as usize;
        match cqueue::buffer_select(flags) {
            Some(bid) => {
                metrics.on_message(n);
                // Copy out, submit the echo, then hand the pool slot back.
                let payload: Box<[u8]> = pool.buffer(bid, n).into();
                submit_send(ring, ops, fd, payload, n)?;
                pool.recycle(bid);
            }
            None => warn!(fd, "recv completion without a selected buffer"),
        }
    }

    if !more {
        // Terminating completion: end of connection, whatever the cause.
        close_fd(fd);
        ops.remove(token);
        metrics.on_close();
        debug!(fd, "connection closed");
    }
    Ok(())
}

fn handle_send(result: i32, ops: &mut OpTable, token: u64) -> io::Result<()> {
    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        debug!(error = %err, "send failed");
    }
    // Short writes and errors are not retried; the copy dies with the record.
    ops.remove(token);
    Ok(())
}

fn submit_accept(ring: &mut IoUring, listener_fd: RawFd, token: u64) -> io::Result<()> {
    let sqe = opcode::AcceptMulti::new(types::Fd(listener_fd))
        .build()
        .user_data(token);
    push_entry(ring, &sqe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::engine::tests::{connect, settle, spawn_engine};
    use std::io::{Read, Write};
    use std::thread;

    #[test]
    fn large_message_spans_pool_buffers() {
        let (shutdown, handle) = spawn_engine(Mode::Multishot, 19994);

        // 16 KiB in one write: four pool buffers, echoed in any chunking.
        let payload: Vec<u8> = (0..16384u32).map(|i| (i % 251) as u8).collect();
        let mut stream = connect(19994);
        stream.write_all(&payload).unwrap();

        let mut echoed = vec![0u8; payload.len()];
        stream.read_exact(&mut echoed).unwrap();
        assert_eq!(echoed, payload);

        drop(stream);
        settle();
        shutdown.store(true, Ordering::Relaxed);

        let metrics = handle.join().unwrap().unwrap();
        assert_eq!(metrics.conns_accepted, 1);
        assert_eq!(metrics.conns_closed, 1);
        assert_eq!(metrics.bytes, 16384);
        assert!(metrics.messages >= 4);
    }

    #[test]
    fn concurrent_connections_round_trip() {
        let (shutdown, handle) = spawn_engine(Mode::Multishot, 19993);

        let mut workers = Vec::new();
        for _ in 0..4 {
            workers.push(thread::spawn(|| {
                let payload = vec![0xa5u8; 4096];
                let mut streams: Vec<_> = (0..5).map(|_| connect(19993)).collect();
                for _ in 0..3 {
                    for stream in &mut streams {
                        stream.write_all(&payload).unwrap();
                        let mut echoed = vec![0u8; payload.len()];
                        stream.read_exact(&mut echoed).unwrap();
                        assert_eq!(echoed, payload);
                    }
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        settle();
        shutdown.store(true, Ordering::Relaxed);

        let metrics = handle.join().unwrap().unwrap();
        assert_eq!(metrics.conns_accepted, 20);
        assert_eq!(metrics.conns_closed, 20);
        assert_eq!(metrics.bytes, 20 * 3 * 4096);
    }
}
