//! Edge-triggered readiness engine.
//!
//! mio arms epoll in edge-triggered mode on Linux, so both the accept path
//! and the per-connection read path drain until the socket would block.
//! Each successful read is echoed back with a single write; short writes
//! are not retried, matching the reference behaviour of the benchmark.

use crate::config::Config;
use crate::engine::bind_listener;
use crate::metrics::Metrics;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LISTENER: Token = Token(usize::MAX);

/// Poll bound so the reporter and shutdown flag are serviced.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

struct Connection {
    stream: TcpStream,
    buf: Box<[u8]>,
    /// Receive cursor, reset after every echo.
    pending: usize,
}

pub fn run(config: &Config, shutdown: &Arc<AtomicBool>) -> io::Result<Metrics> {
    let mut poll = Poll::new()?;
    let mut events = Events::with_capacity(1024);

    let listener = bind_listener(config.port, true)?;
    let mut listener = TcpListener::from_std(listener);
    poll.registry()
        .register(&mut listener, LISTENER, Interest::READABLE)?;

    let mut connections: Slab<Connection> = Slab::new();
    let mut metrics = Metrics::new();

    let result = event_loop(
        config.buffer_size,
        shutdown,
        &mut poll,
        &mut events,
        &listener,
        &mut connections,
        &mut metrics,
    );

    // Teardown runs whether the loop ended by flag or by error: dropping
    // the slab closes every stream once, then the summary is forced.
    metrics.conns_closed += connections.len() as u64;
    metrics.final_report();
    result.map(|_| metrics)
}

fn event_loop(
    buffer_size: usize,
    shutdown: &Arc<AtomicBool>,
    poll: &mut Poll,
    events: &mut Events,
    listener: &TcpListener,
    connections: &mut Slab<Connection>,
    metrics: &mut Metrics,
) -> io::Result<()> {
    while !shutdown.load(Ordering::Relaxed) {
        if let Err(e) = poll.poll(events, Some(POLL_TIMEOUT)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            match event.token() {
                LISTENER => accept_loop(listener, poll, connections, buffer_size, metrics)?,
                Token(conn_id) => {
                    if !event.is_readable() {
                        continue;
                    }
                    if let Err(e) = drain_readable(conn_id, connections, metrics) {
                        debug!(conn_id, error = %e, "connection error");
                        close_connection(poll, connections, conn_id, metrics);
                    }
                }
            }
        }

        metrics.report(false);
    }
    Ok(())
}

fn accept_loop(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    buffer_size: usize,
    metrics: &mut Metrics,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %e, "TCP_NODELAY failed");
                }

                let entry = connections.vacant_entry();
                let conn_id = entry.key();
                let conn = entry.insert(Connection {
                    stream,
                    buf: vec![0u8; buffer_size].into_boxed_slice(),
                    pending: 0,
                });
                poll.registry()
                    .register(&mut conn.stream, Token(conn_id), Interest::READABLE)?;

                metrics.on_accept();
                debug!(conn_id, peer = %peer, "accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                warn!(error = %e, "accept failed");
                break;
            }
        }
    }
    Ok(())
}

/// Read until the socket would block, echoing each chunk as it arrives.
/// Returns Err on peer close or a hard error; the caller closes.
fn drain_readable(
    conn_id: usize,
    connections: &mut Slab<Connection>,
    metrics: &mut Metrics,
) -> io::Result<()> {
    let conn = match connections.get_mut(conn_id) {
        Some(c) => c,
        None => return Ok(()),
    };

    loop {
        let pending = conn.pending;
        let n = match conn.stream.read(&mut conn.buf[pending..]) {
            Ok(0) => return Err(io::ErrorKind::ConnectionReset.into()),
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        let filled = pending + n;
        metrics.on_message(n);

        // One write per read; a short or refused write drops the tail.
        match conn.stream.write(&conn.buf[..filled]) {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        conn.pending = 0;
    }
}

fn close_connection(
    poll: &mut Poll,
    connections: &mut Slab<Connection>,
    conn_id: usize,
    metrics: &mut Metrics,
) {
    if let Some(mut conn) = connections.try_remove(conn_id) {
        let _ = poll.registry().deregister(&mut conn.stream);
        metrics.on_close();
        debug!(conn_id, "connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{connect, settle, spawn_engine};
    use crate::config::Mode;

    #[test]
    fn single_connection_echo() {
        let (shutdown, handle) = spawn_engine(Mode::Epoll, 19991);

        let payload: Vec<u8> = (0..128u32).map(|i| b'A' + (i % 26) as u8).collect();
        let mut stream = connect(19991);
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
        assert!(metrics.messages >= 1);
        assert_eq!(metrics.bytes, 128);
    }

    #[test]
    fn immediate_disconnect_is_counted() {
        let (shutdown, handle) = spawn_engine(Mode::Epoll, 19996);

        let stream = connect(19996);
        drop(stream);
        settle();
        shutdown.store(true, Ordering::Relaxed);

        let metrics = handle.join().unwrap().unwrap();
        assert_eq!(metrics.conns_accepted, 1);
        assert_eq!(metrics.conns_closed, 1);
        assert_eq!(metrics.bytes, 0);
    }
}
