//! The event loop (C7) and control plane (C8): one `mio::Poll` owns the
//! listener, the worker pool's control socket, and signal delivery, and
//! drives every connection's C6 state machine to completion.
//!
//! Unlike the teacher's `select`-over-fd_sets design this doesn't rebuild
//! read/write sets from scratch every iteration; mio is readiness-based,
//! so each connection's registered interest is kept in sync with its
//! flags and bucket state as they change (`sync_interest`), and `Poll`
//! only wakes the loop for connections that are actually eligible. The
//! wake-on-nothing-ready timeout math (ss4.6 step 3) is unchanged: when no
//! connection can currently transmit, the poll timeout is clamped to the
//! time left in the current burst.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use mio::net::{TcpListener, UnixDatagram};
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::bucket::BurstClock;
use crate::config::{read_reload_rate, Config};
use crate::connection::{Connection, Flags, Method, Protocol, Status, TaskStatus};
use crate::registry::{Admission, FileRegistry};
use crate::request::{find_header_end, parse_method, parse_protocol, parse_request_line, resolve_resource};
use crate::response::format_status_line;
use crate::worker::{decode_signal, Task, TaskKind, WorkerPool};

/// Cap on simultaneous connections (matches the teacher's `MAX_CONNECTIONS`).
const MAX_CONNECTIONS: usize = 10_000;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const CONTROL_TOKEN: Token = Token(usize::MAX - 1);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

/// The server: owns the readiness multiplexer and every piece of state
/// it dispatches against.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    control_socket: UnixDatagram,
    control_path: PathBuf,
    signals: Signals,
    connections: Slab<Connection>,
    registry: FileRegistry,
    worker_pool: WorkerPool,
    burst_clock: BurstClock,
    rate: u64,
    root: PathBuf,
    reload_path: PathBuf,
    shutdown: bool,
}

impl Server {
    /// Binds the listener and control socket, spawns the worker pool, and
    /// registers every C7/C8 event source with a fresh `Poll`.
    pub fn new(config: Config) -> io::Result<Self> {
        let poll = Poll::new()?;

        let addr: std::net::SocketAddr = format!("0.0.0.0:{}", config.port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid listen address"))?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        // Stale socket file from a previous, uncleanly-terminated run.
        let _ = std::fs::remove_file(&config.control_socket_path);
        let mut control_socket = UnixDatagram::bind(&config.control_socket_path)?;
        poll.registry()
            .register(&mut control_socket, CONTROL_TOKEN, Interest::READABLE)?;

        let worker_pool = WorkerPool::new(&config.control_socket_path)?;

        let mut signals = Signals::new([SIGTERM, SIGINT, SIGHUP])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        let reload_path = config.reload_path();

        Ok(Server {
            poll,
            listener,
            control_socket,
            control_path: config.control_socket_path.clone(),
            signals,
            connections: Slab::with_capacity(MAX_CONNECTIONS),
            registry: FileRegistry::new(),
            worker_pool,
            burst_clock: BurstClock::new(),
            rate: config.rate,
            root: config.root,
            reload_path,
            shutdown: false,
        })
    }

    /// Runs the event loop until a termination signal arrives.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);

        loop {
            let elapsed = match self.burst_clock.tick() {
                None => {
                    for (_, conn) in self.connections.iter_mut() {
                        conn.bucket.fill();
                    }
                    let keys: Vec<usize> = self.connections.iter().map(|(k, _)| k).collect();
                    for key in keys {
                        self.sync_interest(key)?;
                    }
                    Duration::ZERO
                }
                Some(d) => d,
            };

            let any_transmittable = self.connections.iter().any(|(_, c)| {
                c.bucket.can_transmit() && !c.flags.contains(Flags::SIGNAL_WAIT)
            });
            let timeout = if any_transmittable || self.connections.is_empty() {
                None
            } else {
                Some(BurstClock::remaining(elapsed))
            };

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => {
                        if let Err(e) = self.accept_connections() {
                            error!(error = %e, "accept loop failed");
                        }
                    }
                    CONTROL_TOKEN => self.drain_control_signals(),
                    SIGNAL_TOKEN => self.drain_signals(),
                    Token(key) => {
                        self.handle_connection_event(key, event.is_error() || event.is_read_closed());
                    }
                }
            }

            if self.shutdown {
                return self.cleanup();
            }
        }
    }

    fn accept_connections(&mut self) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if self.connections.len() >= MAX_CONNECTIONS {
                        warn!("connection cap reached, rejecting new connection");
                        continue;
                    }
                    let conn = Connection::new(stream, self.rate);
                    let key = self.connections.insert(conn);
                    let conn = &mut self.connections[key];
                    self.poll
                        .registry()
                        .register(&mut conn.stream, Token(key), Interest::READABLE)?;
                    conn.registered = true;
                    conn.current_interest = Some(Interest::READABLE);
                    debug!(key, "accepted connection");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Ok(());
                }
            }
        }
    }

    fn drain_control_signals(&mut self) {
        loop {
            let mut buf = [0u8; 32];
            match self.control_socket.recv(&mut buf) {
                Ok(n) => {
                    if let Some(key) = decode_signal(&buf[..n]) {
                        self.handle_task_completion(key);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!(error = %e, "control socket recv failed");
                    return;
                }
            }
        }
    }

    fn drain_signals(&mut self) {
        let pending: Vec<i32> = self.signals.pending().collect();
        for signal in pending {
            match signal {
                SIGTERM | SIGINT => {
                    info!(signal, "shutdown signal received");
                    self.shutdown = true;
                }
                SIGHUP => self.handle_reload(),
                _ => {}
            }
        }
    }

    fn handle_reload(&mut self) {
        match read_reload_rate(&self.reload_path) {
            Ok(rate) => {
                self.rate = rate;
                for (_, conn) in self.connections.iter_mut() {
                    conn.bucket.set_rate(rate);
                }
                info!(rate, "reloaded rate from config file");
            }
            Err(e) => warn!(error = %e, "failed to reload config file"),
        }
    }

    fn handle_connection_event(&mut self, key: usize, hangup: bool) {
        if !self.connections.contains(key) {
            return;
        }
        if hangup {
            self.remove_connection(key);
            return;
        }
        if self.connections[key].flags.contains(Flags::SIGNAL_WAIT) {
            return;
        }

        if let Err(e) = self.handle_readable(key) {
            debug!(key, error = %e, "connection error on read");
            self.remove_connection(key);
            return;
        }
        if !self.connections.contains(key) {
            return;
        }

        if let Err(e) = self.handle_writable(key) {
            debug!(key, error = %e, "connection error on write");
            self.remove_connection(key);
            return;
        }
        if !self.connections.contains(key) {
            return;
        }

        if self.connections[key].flags.contains(Flags::FINISHED) {
            self.remove_connection(key);
            return;
        }

        let _ = self.sync_interest(key);
    }

    /// Dispatches the read-side half of C6: reading request bytes, and
    /// reading PUT body bytes directly off the socket.
    fn handle_readable(&mut self, key: usize) -> io::Result<()> {
        let reading_request = self.connections[key].flags.contains(Flags::READ_REQUEST);
        if reading_request {
            self.read_request_bytes(key)?;
            if self.connections.contains(key) && self.connections[key].flags.contains(Flags::REQUEST_RECEIVED)
            {
                self.verify_request(key)?;
            }
            return Ok(());
        }

        let reading_body = self.connections[key].flags.contains(Flags::READ_DATA)
            && !self.connections[key].flags.contains(Flags::SIGNAL_WAIT);
        if reading_body {
            self.read_put_body(key)?;
        }
        Ok(())
    }

    fn read_request_bytes(&mut self, key: usize) -> io::Result<()> {
        let cap = self.connections[key].buffer.len();
        if self.connections[key].pos_buf >= cap - 1 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "request line too long"));
        }

        let allowance = {
            let conn = &self.connections[key];
            conn.bucket.allowance(cap - conn.pos_buf - 1)
        };
        if allowance == 0 {
            return Ok(());
        }

        let read_result = {
            let conn = &mut self.connections[key];
            let pos = conn.pos_buf;
            conn.stream.read(&mut conn.buffer[pos..pos + allowance])
        };

        match read_result {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before request completed",
            )),
            Ok(n) => {
                let conn = &mut self.connections[key];
                conn.bucket.withdraw(n as u64);
                conn.pos_buf += n;
                if let Some(end) = find_header_end(&conn.buffer[..conn.pos_buf]) {
                    conn.pos_header = end;
                    conn.flags.clear(Flags::READ_REQUEST);
                    conn.flags.set(Flags::REQUEST_RECEIVED);
                }
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// C9 + C4: parses the request line, vets the resource, and opens the
    /// file, or routes to `fail_request` on the first thing that doesn't
    /// check out.
    fn verify_request(&mut self, key: usize) -> io::Result<()> {
        let line = {
            let conn = &self.connections[key];
            parse_request_line(&conn.buffer, conn.pos_header)
        };
        let line = match line {
            Some(l) => l,
            None => {
                self.fail_request(key, Status::BadRequest, None, None);
                return Ok(());
            }
        };

        let method = match parse_method(&line.method) {
            Some(m) => m,
            None => {
                self.fail_request(key, Status::NotImplemented, None, None);
                return Ok(());
            }
        };

        let protocol = match parse_protocol(&line.protocol) {
            Some(p) => p,
            None => {
                self.fail_request(key, Status::BadRequest, Some(method), None);
                return Ok(());
            }
        };

        let resource = match resolve_resource(&self.root, &line.resource) {
            Ok(path) => path,
            Err(_) => {
                self.fail_request(key, Status::Forbidden, Some(method), Some(protocol));
                return Ok(());
            }
        };

        let admission = self.registry.verify(&resource, method);
        if admission == Admission::Denied {
            self.fail_request(key, Status::Forbidden, Some(method), Some(protocol));
            return Ok(());
        }

        let open_result = match method {
            Method::Get => std::fs::File::open(&resource),
            Method::Put => std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&resource),
        };
        let file = match open_result {
            Ok(f) => f,
            Err(_) => {
                self.fail_request(key, Status::NotFound, Some(method), Some(protocol));
                return Ok(());
            }
        };

        match admission {
            Admission::AllowedNew => self.registry.insert(resource.clone(), method),
            Admission::AllowedExisting => self.registry.acquire_existing(&resource),
            Admission::Denied => unreachable!("checked above"),
        }

        let (pos_header, pos_buf) = {
            let conn = &mut self.connections[key];
            conn.method = Some(method);
            conn.protocol = Some(protocol);
            conn.status = Status::Ok;
            conn.file = Some(file);
            conn.resource = Some(resource);
            conn.flags.clear(Flags::REQUEST_RECEIVED);
            match method {
                Method::Get => conn.flags.insert_only(Flags::WRITE_HEADER | Flags::WRITE_DATA),
                Method::Put => conn.flags.insert_only(Flags::READ_DATA),
            }
            (conn.pos_header, conn.pos_buf)
        };

        if method == Method::Put && pos_buf > pos_header {
            self.dispatch_put_write(key, pos_header, pos_buf)?;
        }
        Ok(())
    }

    fn fail_request(&mut self, key: usize, status: Status, method: Option<Method>, protocol: Option<Protocol>) {
        let conn = &mut self.connections[key];
        conn.status = status;
        conn.method = method;
        conn.protocol = protocol;
        conn.flags.clear(Flags::REQUEST_RECEIVED);
        conn.flags.insert_only(Flags::WRITE_HEADER | Flags::WRITE_DATA);
    }

    fn read_put_body(&mut self, key: usize) -> io::Result<()> {
        let allowance = {
            let conn = &self.connections[key];
            conn.bucket.allowance(conn.buffer.len())
        };
        if allowance == 0 {
            return Ok(());
        }

        let read_result = {
            let conn = &mut self.connections[key];
            conn.stream.read(&mut conn.buffer[..allowance])
        };

        match read_result {
            Ok(0) => {
                let conn = &mut self.connections[key];
                conn.flags.clear(Flags::READ_DATA);
                conn.flags.set(Flags::WRITE_HEADER | Flags::WRITE_DATA);
                conn.pos_buf = 0;
                conn.pos_header = 0;
                Ok(())
            }
            Ok(n) => {
                {
                    let conn = &mut self.connections[key];
                    conn.bucket.withdraw(n as u64);
                    conn.pos_buf = n;
                    conn.pos_header = 0;
                }
                self.dispatch_put_write(key, 0, n)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn dispatch_put_write(&mut self, key: usize, start: usize, end: usize) -> io::Result<()> {
        let (file, buf) = {
            let conn = &mut self.connections[key];
            let file = conn
                .file
                .take()
                .expect("a PUT connection always holds an open file while ReadData is set");
            let buf = std::mem::take(&mut conn.buffer);
            conn.flags.set(Flags::SIGNAL_WAIT);
            (file, buf)
        };
        self.worker_pool.add(Task {
            conn_key: key,
            kind: TaskKind::Write { start, end },
            file,
            buf,
        });
        Ok(())
    }

    /// Dispatches the write-side half of C6: the status line, the GET
    /// body stream, and the worker read tasks that feed it.
    fn handle_writable(&mut self, key: usize) -> io::Result<()> {
        let wrote_header = self.connections[key].flags.contains(Flags::WRITE_HEADER);
        if wrote_header {
            let conn = &mut self.connections[key];
            let protocol = conn.response_protocol();
            let status = conn.status;
            let n = format_status_line(&mut conn.buffer, protocol, status);
            conn.pos_buf = n;
            conn.flags.clear(Flags::WRITE_HEADER);
        }

        let conn = &self.connections[key];
        let pending = send_pending(conn.pos_buf, conn.flags, wrote_header);
        if pending {
            return self.send_buffered(key);
        }

        let ready_for_body = {
            let conn = &self.connections[key];
            conn.flags.contains(Flags::WRITE_DATA)
                && !conn.flags.contains(Flags::SIGNAL_WAIT)
                && conn.status == Status::Ok
                && conn.method == Some(Method::Get)
                && conn.task_status != TaskStatus::Finished
        };
        if ready_for_body {
            return self.dispatch_get_read(key);
        }

        if self.connections[key].pos_buf == 0 {
            self.connections[key].flags.set(Flags::FINISHED);
        }
        Ok(())
    }

    fn send_buffered(&mut self, key: usize) -> io::Result<()> {
        let send_result = {
            let conn = &mut self.connections[key];
            conn.stream.write(&conn.buffer[..conn.pos_buf])
        };

        match send_result {
            Ok(0) => Err(io::Error::new(io::ErrorKind::WriteZero, "write returned 0")),
            Ok(n) => {
                let conn = &mut self.connections[key];
                conn.bucket.withdraw(n as u64);
                if n == conn.pos_buf {
                    conn.pos_buf = 0;
                    conn.flags.clear(Flags::PENDING_DATA);
                    let is_get_body = conn.status == Status::Ok && conn.method == Some(Method::Get);
                    if !is_get_body || conn.task_status == TaskStatus::Finished {
                        conn.flags.set(Flags::FINISHED);
                    }
                } else {
                    conn.buffer.copy_within(n..conn.pos_buf, 0);
                    conn.pos_buf -= n;
                    conn.flags.set(Flags::PENDING_DATA);
                }
                Ok(())
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.connections[key].flags.set(Flags::PENDING_DATA);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn dispatch_get_read(&mut self, key: usize) -> io::Result<()> {
        let allowance = {
            let conn = &self.connections[key];
            conn.bucket.allowance(conn.buffer.len())
        };
        if allowance == 0 {
            return Ok(());
        }

        let (file, buf) = {
            let conn = &mut self.connections[key];
            let file = conn
                .file
                .take()
                .expect("a GET connection always holds an open file while WriteData is set");
            let buf = std::mem::take(&mut conn.buffer);
            conn.bytes_to_transfer = allowance;
            conn.flags.set(Flags::SIGNAL_WAIT);
            (file, buf)
        };
        self.worker_pool.add(Task {
            conn_key: key,
            kind: TaskKind::Read { len: allowance },
            file,
            buf,
        });
        Ok(())
    }

    /// Resumes a connection parked on `SignalWait` once its worker task's
    /// completion signal arrives over the control socket.
    fn handle_task_completion(&mut self, key: usize) {
        let Some(result) = self.worker_pool.take_result(key) else {
            return;
        };
        if !self.connections.contains(key) {
            // The connection was already torn down (e.g. peer reset)
            // while its task was in flight; the file/buffer simply drop.
            return;
        }

        let conn = &mut self.connections[key];
        conn.file = Some(result.file);
        conn.buffer = result.buf;
        conn.flags.clear(Flags::SIGNAL_WAIT);
        conn.task_status = result.status;

        if result.status == TaskStatus::Error {
            self.remove_connection(key);
            return;
        }

        if conn.flags.contains(Flags::READ_DATA) {
            conn.pos_buf = 0;
            conn.pos_header = 0;
        } else {
            conn.pos_buf = result.bytes;
            conn.pos_header = 0;
        }

        let _ = self.sync_interest(key);
    }

    /// Registers, reregisters, or deregisters `key`'s socket so its poll
    /// interest matches its current flags and bucket state.
    fn sync_interest(&mut self, key: usize) -> io::Result<()> {
        if !self.connections.contains(key) {
            return Ok(());
        }

        let desired = {
            let conn = &self.connections[key];
            let excluded = conn.flags.contains(Flags::SIGNAL_WAIT) || !conn.bucket.can_transmit();
            if excluded {
                None
            } else if conn.flags.contains(Flags::WRITE_DATA) || conn.flags.contains(Flags::PENDING_DATA)
            {
                Some(Interest::WRITABLE)
            } else {
                Some(Interest::READABLE)
            }
        };

        let conn = &mut self.connections[key];
        match (desired, conn.registered) {
            (None, true) => {
                self.poll.registry().deregister(&mut conn.stream)?;
                conn.registered = false;
                conn.current_interest = None;
            }
            (Some(interest), true) if conn.current_interest != Some(interest) => {
                self.poll
                    .registry()
                    .reregister(&mut conn.stream, Token(key), interest)?;
                conn.current_interest = Some(interest);
            }
            (Some(interest), false) => {
                self.poll
                    .registry()
                    .register(&mut conn.stream, Token(key), interest)?;
                conn.registered = true;
                conn.current_interest = Some(interest);
            }
            _ => {}
        }
        Ok(())
    }

    fn remove_connection(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.try_remove(key) {
            if conn.registered {
                let _ = self.poll.registry().deregister(&mut conn.stream);
            }
            if let Some(resource) = conn.resource.take() {
                self.registry.release(&resource);
            }
            debug!(key, "connection closed");
        }
    }

    fn cleanup(mut self) -> io::Result<()> {
        let keys: Vec<usize> = self.connections.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.remove_connection(key);
        }
        self.worker_pool.destroy();
        let _ = std::fs::remove_file(&self.control_path);
        info!("server shut down");
        Ok(())
    }
}

/// Whether the send path (ss4.5 step 7) is live for the current buffer
/// and flags: `WriteHeader` (just formatted this call, passed in as
/// `wrote_header` since the flag is already cleared by the time this is
/// evaluated), `WriteData`, or `PendingData` must be set, and `SignalWait`
/// must not be. A PUT mid-body has only `ReadData` set; `pos_buf > 0`
/// there reflects unconsumed body bytes, not a response waiting to go
/// out, so it must not satisfy this predicate.
fn send_pending(pos_buf: usize, flags: Flags, wrote_header: bool) -> bool {
    pos_buf > 0
        && !flags.contains(Flags::SIGNAL_WAIT)
        && (wrote_header || flags.contains(Flags::WRITE_DATA) || flags.contains(Flags::PENDING_DATA))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_tokens_never_collide_with_a_realistic_slab_key_range() {
        assert!(MAX_CONNECTIONS < LISTENER_TOKEN.0);
        assert!(MAX_CONNECTIONS < CONTROL_TOKEN.0);
        assert!(MAX_CONNECTIONS < SIGNAL_TOKEN.0);
    }

    #[test]
    fn put_mid_body_with_only_read_data_set_never_enters_send_path() {
        // The bug scenario: a PUT whose initial recv ended exactly at the
        // header terminator, so `pos_buf` still holds the (now stale)
        // header length and only `ReadData` is set.
        let flags = Flags::READ_DATA;
        assert!(!send_pending(42, flags, false));
    }

    #[test]
    fn freshly_formatted_header_is_pending_even_though_write_header_is_already_cleared() {
        let flags = Flags::WRITE_DATA;
        assert!(send_pending(19, flags, true));
    }

    #[test]
    fn leftover_unsent_bytes_are_pending_via_pending_data() {
        let flags = Flags::PENDING_DATA;
        assert!(send_pending(5, flags, false));
    }

    #[test]
    fn signal_wait_suppresses_pending_regardless_of_flags() {
        let flags = Flags::WRITE_DATA | Flags::SIGNAL_WAIT;
        assert!(!send_pending(10, flags, false));
    }

    #[test]
    fn zero_buffer_is_never_pending() {
        assert!(!send_pending(0, Flags::WRITE_DATA, true));
    }
}
