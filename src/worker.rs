//! Task queue and worker pool (C3): runs blocking file I/O off the event
//! thread and wakes the event thread back up over a local datagram socket
//! once a task finishes.
//!
//! The original C server keeps one block of memory per connection and
//! lets a worker thread mutate it directly while the event thread looks
//! away (`SignalWait`). Rust has no pointer identity to share safely that
//! way, so this crate follows the note in DESIGN.md: a task temporarily
//! *owns* the pieces of connection state it needs (the open `File` and
//! the buffer slice to read into or write from), the worker performs the
//! blocking operation, and the result — including the mutated buffer —
//! comes back through a results table keyed by the same slab index the
//! datagram payload carries. The datagram itself stays exactly what the
//! spec calls for: a bare signal identifying which connection just
//! finished, carrying no other state.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::net::UnixDatagram;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::connection::TaskStatus;

/// Number of worker threads in the fixed pool (matches the original's
/// hardcoded constant of 4).
const WORKER_COUNT: usize = 4;

/// Fixed-width decimal text used for the control-socket signal payload.
/// Slab keys are `usize`; 20 digits comfortably covers a 64-bit index.
const KEY_FIELD_WIDTH: usize = 20;

/// What a worker should do with the file and buffer it was handed.
pub enum TaskKind {
    /// Read up to `len` bytes from `file` into the buffer.
    Read { len: usize },
    /// Write `buf[start..end]` to `file`.
    Write { start: usize, end: usize },
}

/// A unit of blocking file I/O submitted to the pool.
pub struct Task {
    pub conn_key: usize,
    pub kind: TaskKind,
    pub file: File,
    pub buf: Vec<u8>,
}

/// What a worker hands back once a task completes.
pub struct TaskResult {
    pub file: File,
    pub buf: Vec<u8>,
    pub status: TaskStatus,
    /// Bytes actually transferred (read or written) by this task.
    pub bytes: usize,
}

/// The queue and shutdown flag share one mutex, matching spec ss4.2
/// ("destroy: sets a shutdown flag under the mutex, broadcasts"): a
/// worker's "queue empty and not shutting down" predicate check and its
/// `not_empty.wait` must be atomic with respect to `destroy` setting the
/// flag and notifying, or the notify can land between the two and the
/// worker parks forever.
struct QueueState {
    tasks: VecDeque<Task>,
    shutting_down: bool,
}

struct Shared {
    queue: Mutex<QueueState>,
    not_empty: Condvar,
    results: Mutex<HashMap<usize, TaskResult>>,
}

/// The worker pool: a FIFO task queue drained by a fixed set of threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Vec<JoinHandle<()>>,
    control_socket: UnixDatagram,
    control_path: std::path::PathBuf,
}

impl WorkerPool {
    /// Spawns the fixed worker threads and connects a datagram client
    /// socket to `control_path` (the event thread must already have its
    /// side bound before this call).
    pub fn new(control_path: &Path) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            results: Mutex::new(HashMap::new()),
        });

        let mut handles = Vec::with_capacity(WORKER_COUNT);
        for id in 0..WORKER_COUNT {
            let shared = Arc::clone(&shared);
            let socket = match UnixDatagram::unbound() {
                Ok(s) => s,
                Err(e) => {
                    Self::join_started(&mut handles, &shared);
                    return Err(e);
                }
            };
            if let Err(e) = socket.connect(control_path) {
                Self::join_started(&mut handles, &shared);
                return Err(e);
            }

            let spawned = thread::Builder::new()
                .name(format!("worker-{id}"))
                .spawn(move || worker_loop(id, shared, socket));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    Self::join_started(&mut handles, &shared);
                    return Err(e);
                }
            }
        }

        let control_socket = UnixDatagram::unbound()?;
        control_socket.connect(control_path)?;

        Ok(WorkerPool {
            shared,
            handles,
            control_socket,
            control_path: control_path.to_path_buf(),
        })
    }

    fn join_started(handles: &mut Vec<JoinHandle<()>>, shared: &Arc<Shared>) {
        shared.queue.lock().unwrap().shutting_down = true;
        shared.not_empty.notify_all();
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Appends a task and wakes one waiting worker.
    pub fn add(&self, task: Task) {
        self.shared.queue.lock().unwrap().tasks.push_back(task);
        self.shared.not_empty.notify_one();
    }

    /// Takes ownership of the stored result for `conn_key`, if present.
    pub fn take_result(&self, conn_key: usize) -> Option<TaskResult> {
        self.shared.results.lock().unwrap().remove(&conn_key)
    }

    /// Path of the control socket workers connect to; exposed so the event
    /// loop can bind and unlink the matching server-side socket.
    pub fn control_path(&self) -> &Path {
        &self.control_path
    }

    /// Signals shutdown, joins every worker, and drains the queue.
    pub fn destroy(mut self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.shutting_down = true;
        }
        self.shared.not_empty.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.shared.queue.lock().unwrap().tasks.clear();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>, control_socket: UnixDatagram) {
    loop {
        let task = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if let Some(task) = queue.tasks.pop_front() {
                    break Some(task);
                }
                if queue.shutting_down {
                    break None;
                }
                queue = shared.not_empty.wait(queue).unwrap();
            }
        };

        let Some(mut task) = task else {
            debug!(worker = id, "worker shutting down");
            return;
        };

        let conn_key = task.conn_key;
        let (status, bytes) = run_task(&mut task);

        let result = TaskResult {
            file: task.file,
            buf: task.buf,
            status,
            bytes,
        };
        shared.results.lock().unwrap().insert(conn_key, result);

        let payload = format!("{conn_key:0width$}", width = KEY_FIELD_WIDTH);
        if let Err(e) = control_socket.send(payload.as_bytes()) {
            error!(worker = id, error = %e, "control socket send failed, worker exiting");
            return;
        }
    }
}

fn run_task(task: &mut Task) -> (TaskStatus, usize) {
    match task.kind {
        TaskKind::Read { len } => match task.file.read(&mut task.buf[..len]) {
            Ok(0) => (TaskStatus::Finished, 0),
            Ok(n) if n < len => (TaskStatus::Finished, n),
            Ok(n) => (TaskStatus::MoreData, n),
            Err(_) => (TaskStatus::Error, 0),
        },
        TaskKind::Write { start, end } => match task.file.write_all(&task.buf[start..end]) {
            Ok(()) => (TaskStatus::MoreData, end - start),
            Err(_) => (TaskStatus::Error, 0),
        },
    }
}

/// Decodes a fixed-width decimal control-socket payload back into a slab
/// key.
pub fn decode_signal(payload: &[u8]) -> Option<usize> {
    std::str::from_utf8(payload).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Seek;

    fn scratch_file(contents: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(contents).unwrap();
        file.seek(std::io::SeekFrom::Start(0)).unwrap();
        file
    }

    #[test]
    fn read_task_reports_finished_on_short_read() {
        let file = scratch_file(b"hi");
        let mut task = Task {
            conn_key: 0,
            kind: TaskKind::Read { len: 8192 },
            file,
            buf: vec![0u8; 8192],
        };
        let (status, bytes) = run_task(&mut task);
        assert_eq!(status, TaskStatus::Finished);
        assert_eq!(bytes, 2);
        assert_eq!(&task.buf[..2], b"hi");
    }

    #[test]
    fn write_task_writes_requested_slice() {
        let file = scratch_file(b"");
        let mut task = Task {
            conn_key: 1,
            kind: TaskKind::Write { start: 2, end: 6 },
            file,
            buf: b"xxpayloadxx".to_vec(),
        };
        let (status, bytes) = run_task(&mut task);
        assert_eq!(status, TaskStatus::MoreData);
        assert_eq!(bytes, 4);
    }

    #[test]
    fn signal_round_trips_through_fixed_width_decimal() {
        let payload = format!("{:0width$}", 42, width = KEY_FIELD_WIDTH);
        assert_eq!(decode_signal(payload.as_bytes()), Some(42));
    }

    #[test]
    fn pool_runs_submitted_read_task_and_signals_completion() {
        let dir = tempfile::tempdir().unwrap();
        let control_path = dir.path().join("control.sock");
        let server_socket = UnixDatagram::bind(&control_path).unwrap();
        server_socket
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();

        let pool = WorkerPool::new(&control_path).unwrap();

        let file = scratch_file(b"hello");
        pool.add(Task {
            conn_key: 7,
            kind: TaskKind::Read { len: 8192 },
            file,
            buf: vec![0u8; 8192],
        });

        let mut buf = [0u8; KEY_FIELD_WIDTH];
        let n = server_socket.recv(&mut buf).unwrap();
        assert_eq!(decode_signal(&buf[..n]), Some(7));

        let result = pool.take_result(7).unwrap();
        assert_eq!(result.status, TaskStatus::Finished);
        assert_eq!(&result.buf[..result.bytes], b"hello");

        pool.destroy();
    }

    #[test]
    fn destroy_completes_promptly_with_idle_workers_parked_on_the_condvar() {
        let dir = tempfile::tempdir().unwrap();
        let control_path = dir.path().join("idle-control.sock");
        let _server_socket = UnixDatagram::bind(&control_path).unwrap();

        let pool = WorkerPool::new(&control_path).unwrap();
        // Give every worker a chance to reach `not_empty.wait` with the
        // queue empty before shutdown is requested, so this actually
        // exercises the shutdown-flag/wait race rather than racing ahead
        // of it.
        thread::sleep(std::time::Duration::from_millis(50));

        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            pool.destroy();
            let _ = done_tx.send(());
        });

        done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("destroy() should not hang joining idle workers");
    }
}
