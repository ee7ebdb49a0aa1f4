//! Single-writer access to the build database.
//!
//! The database is owned by one thread; everyone else talks to it through
//! a bounded queue.  Mutations are fire-and-forget and applied strictly in
//! the order they were sent; the first one that fails is reported by the
//! next commit().  Queries wait for their answer, which also means they
//! observe every mutation sent before them.

use crate::db::Database;
use crate::entry::{EdgeKind, Entry, EntryId};
use anyhow::anyhow;
use std::sync::mpsc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Queue depth before senders block.
const QUEUE_DEPTH: usize = 256;

/// A mutation of the persisted graph.
#[derive(Debug, Clone)]
pub enum Mutation {
    MarkDirty(EntryId),
    UnmarkDirty(EntryId, f64),
    AddEdge(EdgeKind, EntryId, EntryId),
    DropEdge(EdgeKind, EntryId, EntryId),
}

impl Mutation {
    fn apply(self, db: &mut Database) -> anyhow::Result<()> {
        match self {
            Mutation::MarkDirty(id) => db.mark_dirty(id),
            Mutation::UnmarkDirty(id, stamp) => db.unmark_dirty(id, stamp),
            Mutation::AddEdge(kind, outgoing, incoming) => db.add_edge(kind, outgoing, incoming),
            Mutation::DropEdge(kind, outgoing, incoming) => db.drop_edge(kind, outgoing, incoming),
        }
    }
}

type Call = Box<dyn FnOnce(&mut Database) + Send>;

enum Request {
    Mutate(Mutation),
    Call(Call),
    Commit(mpsc::Sender<anyhow::Result<()>>),
}

/// Handle to the thread owning the database.
pub struct Store {
    tx: Option<mpsc::SyncSender<Request>>,
    thread: Option<JoinHandle<Database>>,
}

fn serve(mut db: Database, rx: mpsc::Receiver<Request>) -> Database {
    // First mutation failure since the last commit.
    let mut failed: Option<anyhow::Error> = None;
    for req in rx {
        match req {
            Request::Mutate(m) => {
                if failed.is_some() {
                    continue;
                }
                debug!(mutation = ?m, "store");
                let desc = format!("{:?}", m);
                if let Err(err) = m.apply(&mut db) {
                    warn!("store mutation failed: {:#}", err);
                    failed = Some(err.context(desc));
                }
            }
            Request::Call(f) => f(&mut db),
            Request::Commit(reply) => {
                let result = match failed.take() {
                    Some(err) => Err(err),
                    None => db.commit(),
                };
                let _ = reply.send(result);
            }
        }
    }
    db
}

impl Store {
    pub fn spawn(db: Database) -> Store {
        let (tx, rx) = mpsc::sync_channel(QUEUE_DEPTH);
        let thread = std::thread::Builder::new()
            .name("store".into())
            .spawn(move || serve(db, rx))
            .expect("spawn store thread");
        Store {
            tx: Some(tx),
            thread: Some(thread),
        }
    }

    fn send(&self, req: Request) -> anyhow::Result<()> {
        self.tx
            .as_ref()
            .ok_or_else(|| anyhow!("store closed"))?
            .send(req)
            .map_err(|_| anyhow!("store thread exited"))
    }

    /// Run `f` against the database on the store thread and wait for it.
    pub fn call<R, F>(&self, f: F) -> anyhow::Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Database) -> anyhow::Result<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Request::Call(Box::new(move |db| {
            let _ = reply_tx.send(f(db));
        })))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("store thread exited"))?
    }

    /// Queue a mutation.  Failures surface from the next commit().
    pub fn apply(&self, m: Mutation) -> anyhow::Result<()> {
        self.send(Request::Mutate(m))
    }

    /// Wait for all queued mutations and make them durable.
    pub fn commit(&self) -> anyhow::Result<()> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(Request::Commit(reply_tx))?;
        reply_rx
            .recv()
            .map_err(|_| anyhow!("store thread exited"))?
    }

    /// Stop the store thread and take the database back.  Uncommitted
    /// mutations are not committed.
    pub fn close(mut self) -> anyhow::Result<Database> {
        self.tx.take();
        let thread = self.thread.take().ok_or_else(|| anyhow!("store closed"))?;
        thread.join().map_err(|_| anyhow!("store thread panicked"))
    }

    pub fn get(&self, id: EntryId) -> anyhow::Result<Entry> {
        self.call(move |db| db.get(id))
    }

    pub fn find_path(&self, path: &str) -> anyhow::Result<Option<Entry>> {
        let path = path.to_string();
        self.call(move |db| db.find_path(&path))
    }

    pub fn query_outgoing(&self, id: EntryId) -> anyhow::Result<Vec<Entry>> {
        self.call(move |db| db.query_outgoing(id))
    }

    pub fn query_weak_outgoing(&self, id: EntryId) -> anyhow::Result<Vec<EntryId>> {
        self.call(move |db| db.query_weak_outgoing(id))
    }

    pub fn query_incoming(&self, id: EntryId, kind: EdgeKind) -> anyhow::Result<Vec<Entry>> {
        self.call(move |db| db.query_incoming(id, kind))
    }

    pub fn query_outputs(&self, cmd: EntryId) -> anyhow::Result<Vec<Entry>> {
        self.call(move |db| db.query_outputs(cmd))
    }

    pub fn query_producers(&self, id: EntryId) -> anyhow::Result<Vec<Entry>> {
        self.call(move |db| db.query_producers(id))
    }

    pub fn query_dynamic_deps(&self, cmd: EntryId) -> anyhow::Result<Vec<EntryId>> {
        self.call(move |db| db.query_dynamic_deps(cmd))
    }

    pub fn query_path(&self, from: EntryId, to: EntryId) -> anyhow::Result<bool> {
        self.call(move |db| db.query_path(from, to))
    }

    pub fn query_known_dirty(&self) -> anyhow::Result<Vec<Entry>> {
        self.call(|db| db.query_known_dirty())
    }

    pub fn query_files(&self) -> anyhow::Result<Vec<Entry>> {
        self.call(|db| db.query_files())
    }

    pub fn add_source(&self, path: &str, stamp: f64) -> anyhow::Result<Entry> {
        let path = path.to_string();
        self.call(move |db| db.add_source(&path, stamp))
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.tx.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
