//! Single-shot completion engine.
//!
//! One accept is in flight at all times; each connection alternates
//! between a single recv and a single send. The 4 KiB buffer is handed
//! from the read record to the write record and back, so a connection
//! owns exactly one heap buffer for its whole life. Partial sends are not
//! retried; the buffer is fully re-armed on the next read cycle.

use crate::config::Config;
use crate::engine::{
    bind_listener, close_fd, push_entry, set_nodelay, submit_and_wait_bounded, submit_send,
};
use crate::engine::op::{OpTable, PendingOp};
use crate::metrics::Metrics;
use io_uring::{opcode, types, IoUring};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub fn run(config: &Config, shutdown: &Arc<AtomicBool>) -> io::Result<Metrics> {
    let mut ring = IoUring::new(config.ring_size)?;
    let listener = bind_listener(config.port, false)?;
    let listener_fd = listener.as_raw_fd();

    let mut ops = OpTable::with_capacity(config.ring_size as usize);
    let mut metrics = Metrics::new();

    let result = event_loop(
        config.buffer_size,
        shutdown,
        &mut ring,
        &mut ops,
        listener_fd,
        &mut metrics,
    );

    // Teardown runs whether the loop ended by flag or by error: close the
    // descriptors still held by records, force the summary, and let the
    // kernel release in-flight operations with the ring.
    metrics.conns_closed += ops.drain_close();
    metrics.final_report();
    result.map(|_| metrics)
}

fn event_loop(
    buffer_size: usize,
    shutdown: &Arc<AtomicBool>,
    ring: &mut IoUring,
    ops: &mut OpTable,
    listener_fd: RawFd,
    metrics: &mut Metrics,
) -> io::Result<()> {
    submit_accept(ring, ops, listener_fd)?;
    ring.submit()?;

    while !shutdown.load(Ordering::Relaxed) {
        submit_and_wait_bounded(ring)?;

        loop {
            let cqe = match ring.completion().next() {
                Some(cqe) => cqe,
                None => break,
            };

            dispatch(
                ring,
                ops,
                listener_fd,
                buffer_size,
                cqe.user_data(),
                cqe.result(),
                metrics,
            )?;
            // Flush whatever the dispatch queued.
            ring.submit()?;
        }

        metrics.report(false);
    }
    Ok(())
}

fn dispatch(
    ring: &mut IoUring,
    ops: &mut OpTable,
    listener_fd: RawFd,
    buffer_size: usize,
    token: u64,
    result: i32,
    metrics: &mut Metrics,
) -> io::Result<()> {
    let op = match ops.remove(token) {
        Some(op) => op,
        None => {
            warn!(token, "completion for unknown operation");
            return Ok(());
        }
    };

    match op {
        PendingOp::Accept => {
            handle_accept(result, ring, ops, listener_fd, buffer_size, metrics)
        }
        PendingOp::Recv { fd, buf } => handle_read(result, fd, buf, ring, ops, metrics),
        PendingOp::Send { fd, buf, .. } => handle_write(result, fd, buf, ring, ops, metrics),
    }
}

fn handle_accept(
    result: i32,
    ring: &mut IoUring,
    ops: &mut OpTable,
    listener_fd: RawFd,
    buffer_size: usize,
    metrics: &mut Metrics,
) -> io::Result<()> {
    if result < 0 {
        let err = io::Error::from_raw_os_error(-result);
        warn!(error = %err, "accept failed; no longer accepting");
        return Ok(());
    }

    // Keep one accept armed before servicing the new connection.
    submit_accept(ring, ops, listener_fd)?;

    let fd = result;
    if let Err(e) = set_nodelay(fd) {
        debug!(fd, error = %e, "TCP_NODELAY failed");
    }
    metrics.on_accept();
    debug!(fd, "accepted connection");

    submit_recv(ring, ops, fd, vec![0u8; buffer_size].into_boxed_slice())
}

fn handle_read(
    result: i32,
    fd: RawFd,
    buf: Option<Box<[u8]>>,
    ring: &mut IoUring,
    ops: &mut OpTable,
    metrics: &mut Metrics,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(fd, error = %err, "recv failed");
        } else {
            debug!(fd, "peer closed connection");
        }
        close_fd(fd);
        metrics.on_close();
        return Ok(());
    }

    let n = result as usize;
    metrics.on_message(n);

    // Buffer ownership moves to the write record; exactly n bytes go out.
    match buf {
        Some(buf) => submit_send(ring, ops, fd, buf, n),
        None => {
            warn!(fd, "read record without a buffer");
            close_fd(fd);
            metrics.on_close();
            Ok(())
        }
    }
}

fn handle_write(
    result: i32,
    fd: RawFd,
    buf: Box<[u8]>,
    ring: &mut IoUring,
    ops: &mut OpTable,
    metrics: &mut Metrics,
) -> io::Result<()> {
    if result <= 0 {
        if result < 0 {
            let err = io::Error::from_raw_os_error(-result);
            debug!(fd, error = %err, "send failed");
        }
        close_fd(fd);
        metrics.on_close();
        return Ok(());
    }

    // Short writes are not retried; the whole buffer re-arms the read.
    submit_recv(ring, ops, fd, buf)
}

fn submit_accept(ring: &mut IoUring, ops: &mut OpTable, listener_fd: RawFd) -> io::Result<()> {
    let token = ops.insert(PendingOp::Accept);
    let sqe = opcode::Accept::new(
        types::Fd(listener_fd),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    )
    .build()
    .user_data(token);
    push_entry(ring, &sqe)
}

fn submit_recv(
    ring: &mut IoUring,
    ops: &mut OpTable,
    fd: RawFd,
    mut buf: Box<[u8]>,
) -> io::Result<()> {
    let ptr = buf.as_mut_ptr();
    let len = buf.len() as u32;
    let token = ops.insert(PendingOp::Recv { fd, buf: Some(buf) });
    let sqe = opcode::Recv::new(types::Fd(fd), ptr, len)
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
    fn ten_connections_five_rounds() {
        let (shutdown, handle) = spawn_engine(Mode::Uring, 19992);

        let mut clients = Vec::new();
        for _ in 0..10 {
            clients.push(thread::spawn(|| {
                let payload = vec![0x5au8; 1024];
                let mut stream = connect(19992);
                for _ in 0..5 {
                    stream.write_all(&payload).unwrap();
                    let mut echoed = vec![0u8; payload.len()];
                    stream.read_exact(&mut echoed).unwrap();
                    assert_eq!(echoed, payload);
                }
            }));
        }
        for client in clients {
            client.join().unwrap();
        }

        settle();
        shutdown.store(true, Ordering::Relaxed);

        let metrics = handle.join().unwrap().unwrap();
        assert_eq!(metrics.conns_accepted, 10);
        assert_eq!(metrics.conns_closed, 10);
        assert!(metrics.messages >= 50);
        assert_eq!(metrics.bytes, 51200);
    }
}
