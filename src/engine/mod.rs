//! The three interchangeable network engines.
//!
//! Each engine drives the same connection lifecycle (accept, echo, close)
//! and the same metrics surface from a single-threaded event loop:
//!
//! - `epoll`: edge-triggered readiness via mio
//! - `uring`: single-shot io_uring submissions
//! - `multishot`: multishot io_uring with a provided buffer ring
//!
//! Engines observe the shutdown flag at the top of every loop iteration
//! and after each bounded wait, then return their final counters.

mod buf_ring;
mod epoll;
mod multishot;
mod op;
mod uring;

use crate::config::{Config, Mode};
use crate::metrics::Metrics;
use io_uring::{squeue, types, IoUring};
use op::{OpTable, PendingOp};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const LISTEN_BACKLOG: i32 = 512;

/// Completion-wait bound so the reporter and shutdown flag are serviced.
const WAIT_TIMEOUT_NS: u32 = 100_000_000;

/// Run the selected engine until the shutdown flag is set. Each engine
/// emits the forced final status line on every exit path past setup,
/// including mid-loop errors.
pub fn run(config: &Config, shutdown: &Arc<AtomicBool>) -> io::Result<Metrics> {
    match config.mode {
        Mode::Epoll => epoll::run(config, shutdown),
        Mode::Uring => uring::run(config, shutdown),
        Mode::Multishot => multishot::run(config, shutdown),
    }
}

/// IPv4 listener with SO_REUSEADDR and SO_REUSEPORT, bound to all
/// interfaces. Only the readiness engine needs it non-blocking.
fn bind_listener(port: u16, nonblocking: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    if nonblocking {
        socket.set_nonblocking(true)?;
    }
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn set_nodelay(fd: RawFd) -> io::Result<()> {
    let one: libc::c_int = 1;
    // SAFETY: fd came from a successful accept; the option value outlives
    // the call.
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn close_fd(fd: RawFd) {
    // SAFETY: each fd is closed exactly once along the engine close paths.
    unsafe { libc::close(fd) };
}

/// Submit pending entries and wait up to 100 ms for one completion.
/// Timeouts and signal interruptions return Ok; the caller re-checks the
/// shutdown flag and runs the reporter either way.
fn submit_and_wait_bounded(ring: &IoUring) -> io::Result<()> {
    let ts = types::Timespec::new().nsec(WAIT_TIMEOUT_NS);
    let args = types::SubmitArgs::new().timespec(&ts);
    match ring.submitter().submit_with_args(1, &args) {
        Ok(_) => Ok(()),
        Err(ref e) if e.raw_os_error() == Some(libc::ETIME) => Ok(()),
        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
        Err(e) => Err(e),
    }
}

/// Push one entry, flushing and retrying once if the submission queue is
/// full. On a second failure the engine bails; the record stays in the op
/// table so the teardown drain closes its descriptor exactly once and
/// accounts for it in `conns_closed`.
fn push_entry(ring: &mut IoUring, entry: &squeue::Entry) -> io::Result<()> {
    // SAFETY: buffers referenced by the entry live in the op table until
    // the matching completion is dispatched or the table is drained.
    unsafe {
        if ring.submission().push(entry).is_ok() {
            return Ok(());
        }
    }
    ring.submit()?;
    unsafe {
        if ring.submission().push(entry).is_ok() {
            return Ok(());
        }
    }
    Err(io::Error::new(io::ErrorKind::Other, "submission queue full"))
}

/// Single-shot send of `len` bytes; the record owns the buffer until the
/// completion frees it.
fn submit_send(
    ring: &mut IoUring,
    ops: &mut OpTable,
    fd: RawFd,
    buf: Box<[u8]>,
    len: usize,
) -> io::Result<()> {
    let ptr = buf.as_ptr();
    let token = ops.insert(PendingOp::Send { fd, buf, len });
    let sqe = io_uring::opcode::Send::new(types::Fd(fd), ptr, len as u32)
        .build()
        .user_data(token);
    push_entry(ring, &sqe)
}
