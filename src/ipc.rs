//! Channels to workers.  Every worker, whatever it runs on, feeds one
//! event queue that the scheduler waits on.

use crate::message::{FromWorker, ResultsMessage, ToWorker};
use crate::worker;
use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker {}", self.0)
    }
}

#[derive(Debug)]
pub enum Event {
    Spawned,
    Results(ResultsMessage),
    /// The worker's channel failed; whatever it was running is lost.
    Closed(String),
}

impl From<FromWorker> for Event {
    fn from(msg: FromWorker) -> Event {
        match msg {
            FromWorker::Spawned => Event::Spawned,
            FromWorker::Results(r) => Event::Results(r),
        }
    }
}

/// Where workers run.
#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    /// Threads of this process.
    Thread,
    /// Child processes running `<exe> worker`.
    Process(PathBuf),
}

type Events = mpsc::Sender<(WorkerId, Event)>;

/// The sending half of a worker's channel.
pub trait WorkerLink {
    fn send(&mut self, msg: ToWorker) -> anyhow::Result<()>;
    /// Close the channel.  The worker exits once it finishes any task in
    /// flight.
    fn shutdown(&mut self);
}

struct ThreadLink {
    tx: Option<mpsc::Sender<ToWorker>>,
}

impl WorkerLink for ThreadLink {
    fn send(&mut self, msg: ToWorker) -> anyhow::Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| anyhow!("worker shut down"))?
            .send(msg)
            .map_err(|_| anyhow!("worker thread exited"))
    }

    fn shutdown(&mut self) {
        self.tx.take();
    }
}

fn spawn_thread(id: WorkerId, events: Events, root: &Path) -> anyhow::Result<Box<dyn WorkerLink>> {
    let (tx, rx) = mpsc::channel::<ToWorker>();
    let root = root.to_path_buf();
    std::thread::Builder::new()
        .name(format!("worker{}", id.0))
        .spawn(move || {
            if events.send((id, Event::Spawned)).is_err() {
                return;
            }
            for msg in rx {
                let ToWorker::Task(task) = msg;
                let result = std::panic::catch_unwind(|| worker::execute(&root, &task))
                    .unwrap_or_else(|_| ResultsMessage::failure(task.task_id, "worker panicked"));
                if events.send((id, Event::Results(result))).is_err() {
                    return;
                }
            }
        })?;
    Ok(Box::new(ThreadLink { tx: Some(tx) }))
}

struct ProcessLink {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl WorkerLink for ProcessLink {
    fn send(&mut self, msg: ToWorker) -> anyhow::Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| anyhow!("worker shut down"))?;
        let mut line = serde_json::to_string(&msg)?;
        line.push('\n');
        stdin.write_all(line.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.stdin.take();
        if let Err(err) = self.child.wait() {
            warn!("wait for worker: {}", err);
        }
    }
}

fn spawn_process(
    id: WorkerId,
    events: Events,
    root: &Path,
    exe: &Path,
) -> anyhow::Result<Box<dyn WorkerLink>> {
    let mut child = std::process::Command::new(exe)
        .arg("worker")
        .current_dir(root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .with_context(|| format!("spawn worker {}", exe.display()))?;
    let stdin = child.stdin.take();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("worker has no stdout"))?;
    std::thread::Builder::new()
        .name(format!("worker{}-reader", id.0))
        .spawn(move || {
            let reason = read_events(id, BufReader::new(stdout), &events);
            let _ = events.send((id, Event::Closed(reason)));
        })?;
    Ok(Box::new(ProcessLink { child, stdin }))
}

/// Forward messages from a worker's output until it ends, returning why.
fn read_events(id: WorkerId, input: impl BufRead, events: &Events) -> String {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => return format!("read: {}", err),
        };
        let msg: FromWorker = match serde_json::from_str(&line) {
            Ok(msg) => msg,
            Err(err) => return format!("bad message {:?}: {}", line, err),
        };
        if events.send((id, msg.into())).is_err() {
            break;
        }
    }
    "exited".to_string()
}

/// Start a worker on `backend`.  This is the only place that knows about
/// the different backends.
pub fn spawn_worker(
    backend: &Backend,
    id: WorkerId,
    events: Events,
    root: &Path,
) -> anyhow::Result<Box<dyn WorkerLink>> {
    match backend {
        Backend::Thread => spawn_thread(id, events, root),
        Backend::Process(exe) => spawn_process(id, events, root, exe),
    }
}

/// Multiplexes the channels of all registered workers.
pub struct Pump {
    backend: Backend,
    root: PathBuf,
    tx: Events,
    rx: mpsc::Receiver<(WorkerId, Event)>,
    links: FxHashMap<WorkerId, Box<dyn WorkerLink>>,
    next_id: usize,
}

impl Pump {
    pub fn new(backend: Backend, root: &Path) -> Self {
        let (tx, rx) = mpsc::channel();
        Pump {
            backend,
            root: root.to_path_buf(),
            tx,
            rx,
            links: FxHashMap::default(),
            next_id: 0,
        }
    }

    /// Start a new worker.  It reports Event::Spawned once ready.
    pub fn register(&mut self) -> anyhow::Result<WorkerId> {
        let id = WorkerId(self.next_id);
        self.next_id += 1;
        let link = spawn_worker(&self.backend, id, self.tx.clone(), &self.root)?;
        self.links.insert(id, link);
        debug!(%id, backend = ?self.backend, "registered");
        Ok(id)
    }

    pub fn send(&mut self, id: WorkerId, msg: ToWorker) -> anyhow::Result<()> {
        self.links
            .get_mut(&id)
            .ok_or_else(|| anyhow!("{} is not registered", id))?
            .send(msg)
    }

    /// Wait up to `timeout` for an event from a registered worker.
    pub fn wait(&self, timeout: Duration) -> Option<(WorkerId, Event)> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(left) {
                Ok((id, event)) if self.links.contains_key(&id) => return Some((id, event)),
                Ok((id, event)) => debug!(%id, ?event, "event from deregistered worker"),
                // The pump holds a sender itself, so the channel can't
                // disconnect.
                Err(_) => return None,
            }
        }
    }

    pub fn deregister(&mut self, id: WorkerId) {
        if let Some(mut link) = self.links.remove(&id) {
            link.shutdown();
        }
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn shutdown(&mut self) {
        let ids: Vec<WorkerId> = self.links.keys().copied().collect();
        for id in ids {
            self.deregister(id);
        }
    }
}

impl Drop for Pump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
