//! The scheduler: hands ready tasks to workers, folds their results back
//! into the graph, and unblocks whatever was waiting on them.

use crate::canon::canon_path;
use crate::densemap::DenseMap;
use crate::entry::{EdgeKind, EntryId, NodeType};
use crate::error::GraphError;
use crate::fs;
use crate::ipc::{Backend, Event, Pump, WorkerId};
use crate::message::{ResultsMessage, ToWorker};
use crate::progress::Progress;
use crate::store::{Mutation, Store};
use crate::trace;
use crate::tree::{TaskId, TaskTree};
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long to wait for a worker before checking for an interrupt.
const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    InProgress,
    Succeeded,
    /// Nothing needed to run.
    NoChanges,
    Failed,
    Interrupted,
}

impl BuildStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Succeeded | BuildStatus::NoChanges)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for other tasks.
    Blocked,
    Ready,
    Running,
    Done,
    Failed,
}

impl TaskState {
    const ALL: [TaskState; 5] = [
        TaskState::Blocked,
        TaskState::Ready,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Number of tasks in each TaskState.
#[derive(Default, Clone, Debug, PartialEq)]
pub struct StateCounts([usize; 5]);

impl StateCounts {
    pub fn get(&self, state: TaskState) -> usize {
        self.0[state.index()]
    }

    pub fn add(&mut self, state: TaskState, delta: isize) {
        let n = &mut self.0[state.index()];
        *n = n.wrapping_add_signed(delta);
    }

    pub fn total(&self) -> usize {
        TaskState::ALL.iter().map(|&s| self.get(s)).sum()
    }
}

pub struct MasterOptions {
    pub jobs: usize,
    pub refactor: bool,
    pub backend: Backend,
    pub tools_env: Option<BTreeMap<String, String>>,
    /// Polled between events; once set, nothing more is dispatched.
    pub interrupt: &'static AtomicBool,
}

pub struct TaskMaster<'a> {
    store: &'a Store,
    tree: TaskTree,
    progress: &'a mut dyn Progress,
    options: MasterOptions,
    root: PathBuf,
    pump: Pump,

    states: DenseMap<TaskId, TaskState>,
    counts: StateCounts,
    ready: VecDeque<TaskId>,
    idle: Vec<WorkerId>,
    /// Task each busy worker is running, and when it started.
    assigned: FxHashMap<WorkerId, (TaskId, Instant)>,
    /// Workers whose Spawned event has not arrived yet.
    starting: FxHashSet<WorkerId>,

    status: BuildStatus,
    /// Description of the first failed task.
    failure: Option<String>,
    /// A graph error that stopped the build.
    fatal: Option<anyhow::Error>,
}

impl<'a> TaskMaster<'a> {
    pub fn new(
        store: &'a Store,
        tree: TaskTree,
        progress: &'a mut dyn Progress,
        options: MasterOptions,
        root: &Path,
    ) -> Self {
        let states = DenseMap::sized_like(&tree.tasks, TaskState::Blocked);
        let mut counts = StateCounts::default();
        counts.add(TaskState::Blocked, tree.len() as isize);
        let pump = Pump::new(options.backend.clone(), root);
        TaskMaster {
            store,
            tree,
            progress,
            options,
            root: root.to_path_buf(),
            pump,
            states,
            counts,
            ready: VecDeque::new(),
            idle: Vec::new(),
            assigned: FxHashMap::default(),
            starting: FxHashSet::default(),
            status: BuildStatus::InProgress,
            failure: None,
            fatal: None,
        }
    }

    pub fn status(&self) -> BuildStatus {
        self.status
    }

    /// The first task failure, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Number of tasks that completed successfully.
    pub fn tasks_run(&self) -> usize {
        self.counts.get(TaskState::Done)
    }

    pub fn counts(&self) -> &StateCounts {
        &self.counts
    }

    fn set_state(&mut self, id: TaskId, state: TaskState) {
        let prev = std::mem::replace(&mut self.states[id], state);
        self.counts.add(prev, -1);
        self.counts.add(state, 1);
        self.progress.update(&self.counts);
    }

    fn make_ready(&mut self, id: TaskId) {
        self.set_state(id, TaskState::Ready);
        self.ready.push_back(id);
    }

    fn fail(&mut self, why: String) {
        warn!("build failed: {}", why);
        if self.failure.is_none() {
            self.failure = Some(why);
        }
        if self.status == BuildStatus::InProgress {
            self.status = BuildStatus::Failed;
        }
    }

    fn fail_fatal(&mut self, err: anyhow::Error) {
        self.fail(format!("{:#}", err));
        if self.fatal.is_none() {
            self.fatal = Some(err);
        }
    }

    /// Hand ready tasks to idle workers.
    fn dispatch(&mut self) -> anyhow::Result<()> {
        while self.status == BuildStatus::InProgress {
            if self.ready.is_empty() || self.idle.is_empty() {
                break;
            }
            let (Some(id), Some(worker)) = (self.ready.pop_front(), self.idle.pop()) else {
                break;
            };
            let msg = self.tree.task(id).to_message(self.options.tools_env.clone())?;
            self.set_state(id, TaskState::Running);
            self.progress.task_started(id, self.tree.task(id));
            debug!(task = id.as_usize(), %worker, "dispatch");
            self.assigned.insert(worker, (id, Instant::now()));
            if let Err(err) = self.pump.send(worker, ToWorker::Task(msg)) {
                self.worker_lost(worker, format!("{:#}", err));
            }
        }
        Ok(())
    }

    /// A worker's channel failed: its task fails with it.
    fn worker_lost(&mut self, worker: WorkerId, reason: String) {
        warn!(%worker, "lost: {}", reason);
        self.pump.deregister(worker);
        self.idle.retain(|&w| w != worker);
        self.starting.remove(&worker);
        if let Some((id, _)) = self.assigned.remove(&worker) {
            let result =
                ResultsMessage::failure(id.as_usize(), format!("stale: {} {}", worker, reason));
            self.progress.task_finished(id, self.tree.task(id), &result);
            self.set_state(id, TaskState::Failed);
            self.fail(format!("{}: {} {}", self.tree.task(id).message(), worker, reason));
        }
        if self.pump.is_empty() && self.status == BuildStatus::InProgress {
            self.fail("all workers exited".to_string());
        }
    }

    fn on_results(&mut self, worker: WorkerId, result: ResultsMessage) -> anyhow::Result<()> {
        let Some((id, started)) = self.assigned.remove(&worker) else {
            bail!("{} sent results for task {} it wasn't running", worker, result.task_id);
        };
        if id.as_usize() != result.task_id {
            bail!(
                "{} sent results for task {} while running {}",
                worker,
                result.task_id,
                id.as_usize()
            );
        }
        self.idle.push(worker);
        // Track 0 of the trace is the main thread.
        let track = worker.index() + 1;
        trace::write_complete(&self.tree.task(id).message(), track, started, Instant::now());
        self.progress.task_finished(id, self.tree.task(id), &result);

        if !result.ok {
            self.set_state(id, TaskState::Failed);
            self.fail(format!("{} failed", self.tree.task(id).message()));
            return Ok(());
        }
        if let Err(err) = self.complete(id, &result) {
            // Tasks in flight still finish and get recorded before run()
            // returns the error.
            self.set_state(id, TaskState::Failed);
            self.fail_fatal(err);
            return Ok(());
        }
        self.set_state(id, TaskState::Done);

        let outgoing = self.tree.task(id).outgoing.clone();
        for out in outgoing {
            let waiting = &mut self.tree.task_mut(out).incoming;
            waiting.remove(&id);
            if waiting.is_empty() && self.states[out] == TaskState::Blocked {
                self.make_ready(out);
            }
        }
        Ok(())
    }

    /// Record a successful task in the store: its discovered dependencies,
    /// its clean state and its outputs' stamps.
    fn complete(&self, id: TaskId, result: &ResultsMessage) -> anyhow::Result<()> {
        if let Some(deps) = &result.deps {
            self.merge_deps(id, deps)?;
        }
        let task = self.tree.task(id);
        self.store.apply(Mutation::UnmarkDirty(task.entry.id, 0.0))?;
        for (path, stamp) in &result.updates {
            let Some((out, _)) = task.outputs.iter().find(|(_, p)| p == path) else {
                bail!("{} reported undeclared output {}", task.message(), path);
            };
            self.store.apply(Mutation::UnmarkDirty(*out, *stamp))?;
        }
        Ok(())
    }

    /// Replace the task's dynamic dependencies with `deps`.
    fn merge_deps(&self, id: TaskId, deps: &[String]) -> anyhow::Result<()> {
        let task = self.tree.task(id);
        let cmd = task.entry.id;
        let own_outputs: FxHashSet<EntryId> = task.outputs.iter().map(|(id, _)| *id).collect();
        let declared: FxHashSet<EntryId> = self
            .store
            .query_incoming(cmd, EdgeKind::Strong)?
            .into_iter()
            .map(|e| e.id)
            .collect();

        let mut found = BTreeSet::new();
        for path in deps {
            let mut known = self.store.find_path(path)?;
            if known.is_none() && !Path::new(path).is_absolute() {
                // Sources are stored absolute.
                known = self.store.find_path(&canon_path(&self.root.join(path).to_string_lossy()))?;
            }
            let entry = match known {
                Some(entry) => entry,
                None if Path::new(path).is_absolute() => {
                    if self.options.refactor {
                        return Err(GraphError::Refactor {
                            kind: "input",
                            path: path.clone(),
                        }
                        .into());
                    }
                    let stamp = fs::stat(path)?.as_stamp();
                    info!(%path, command = %task.message(), "new source");
                    self.store.add_source(path, stamp)?
                }
                None => {
                    return Err(GraphError::UndeclaredOutput {
                        path: path.clone(),
                        command: task.message(),
                    }
                    .into())
                }
            };
            if own_outputs.contains(&entry.id) {
                continue;
            }
            match entry.ty {
                NodeType::Source => {}
                ty if ty.is_output() => {
                    if self.store.query_path(cmd, entry.id)? {
                        return Err(GraphError::Cycle(format!(
                            "{} reads {}, which depends on it",
                            task.message(),
                            path
                        ))
                        .into());
                    }
                    if !self.store.query_path(entry.id, cmd)? {
                        return Err(GraphError::AmbiguousOrder {
                            path: path.clone(),
                            command: task.message(),
                        }
                        .into());
                    }
                }
                ty => {
                    return Err(GraphError::PathConflict {
                        path: path.clone(),
                        existing: ty.as_str().to_string(),
                        requested: "input".to_string(),
                    }
                    .into())
                }
            }
            if !declared.contains(&entry.id) {
                found.insert(entry.id);
            }
        }

        let old: BTreeSet<EntryId> = self.store.query_dynamic_deps(cmd)?.into_iter().collect();
        for &dep in found.difference(&old) {
            self.store.apply(Mutation::AddEdge(EdgeKind::Dynamic, cmd, dep))?;
        }
        for &dep in old.difference(&found) {
            self.store.apply(Mutation::DropEdge(EdgeKind::Dynamic, cmd, dep))?;
        }
        Ok(())
    }

    fn handle(&mut self, worker: WorkerId, event: Event) -> anyhow::Result<()> {
        match event {
            Event::Spawned => {
                if self.starting.remove(&worker) {
                    self.idle.push(worker);
                }
            }
            Event::Results(result) => self.on_results(worker, result)?,
            Event::Closed(reason) => self.worker_lost(worker, reason),
        }
        Ok(())
    }

    fn check_interrupt(&mut self) {
        if self.status == BuildStatus::InProgress && self.options.interrupt.load(Ordering::Relaxed) {
            self.progress.log("interrupted");
            self.status = BuildStatus::Interrupted;
        }
    }

    /// Run the build to completion.  Task failures end up in the returned
    /// status; graph errors found along the way are returned as errors once
    /// the tasks in flight have finished.
    pub fn run(&mut self) -> anyhow::Result<BuildStatus> {
        if self.tree.leafs.is_empty() {
            self.status = BuildStatus::NoChanges;
            return Ok(self.status);
        }
        for leaf in self.tree.leafs.clone() {
            self.make_ready(leaf);
        }

        let workers = self.options.jobs.min(self.tree.max_parallel).max(1);
        info!(workers, tasks = self.tree.len(), root = %self.root.display(), "run");
        for _ in 0..workers {
            let worker = self.pump.register()?;
            self.starting.insert(worker);
        }

        loop {
            self.check_interrupt();
            self.dispatch()?;
            if self.assigned.is_empty() {
                if self.status != BuildStatus::InProgress {
                    break;
                }
                if self.counts.get(TaskState::Done) == self.tree.len() {
                    self.status = BuildStatus::Succeeded;
                    break;
                }
                if self.ready.is_empty() {
                    bail!("no task can run, but the build is unfinished");
                }
            }
            if let Some((worker, event)) = self.pump.wait(WAIT_TIMEOUT) {
                self.handle(worker, event)?;
            }
        }
        self.pump.shutdown();

        if let Some(err) = self.fatal.take() {
            return Err(err);
        }
        Ok(self.status)
    }
}
