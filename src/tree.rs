//! Turns the damaged commands of a build graph into a tree of tasks, each
//! knowing which tasks wait for it and which it waits for.

use crate::damage::Damage;
use crate::densemap::{self, DenseMap};
use crate::entry::{CommandData, Entry, EntryId};
use crate::graph::NodeId;
use crate::message::TaskMessage;
use crate::store::Store;
use anyhow::anyhow;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct TaskId(usize);
impl densemap::Index for TaskId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for TaskId {
    fn from(u: usize) -> TaskId {
        TaskId(u)
    }
}
impl TaskId {
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub node: NodeId,
    /// The command entry this task runs.
    pub entry: Entry,
    pub folder: Option<String>,
    pub outputs: Vec<(EntryId, String)>,
    /// Tasks waiting for this one.
    pub outgoing: Vec<TaskId>,
    /// Tasks this one still waits for.
    pub incoming: FxHashSet<TaskId>,
}

impl Task {
    pub fn data(&self) -> anyhow::Result<&CommandData> {
        self.entry
            .data
            .as_ref()
            .ok_or_else(|| anyhow!("{} has no command data", self.entry))
    }

    pub fn message(&self) -> String {
        self.entry.message()
    }

    pub fn to_message(
        &self,
        tools_env: Option<BTreeMap<String, String>>,
    ) -> anyhow::Result<TaskMessage> {
        let data = self.data()?;
        Ok(TaskMessage {
            task_id: self.id.0,
            task_type: data.task_type().to_string(),
            task_data: data.clone(),
            task_folder: self.folder.clone(),
            task_outputs: self.outputs.iter().map(|(_, path)| path.clone()).collect(),
            tools_env,
        })
    }
}

#[derive(Default)]
pub struct TaskTree {
    pub tasks: DenseMap<TaskId, Task>,
    /// Tasks that can run right away.
    pub leafs: Vec<TaskId>,
    /// The most tasks that can ever be ready at once, as seen while
    /// building the tree.
    pub max_parallel: usize,
}

impl TaskTree {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id]
    }

    /// Group tasks into steps: every task of a step is ready once all
    /// earlier steps are done.
    pub fn steps(&self) -> Vec<Vec<TaskId>> {
        let mut waiting: Vec<usize> = self.tasks.values().map(|t| t.incoming.len()).collect();
        let mut steps = Vec::new();
        let mut step = self.leafs.clone();
        while !step.is_empty() {
            let mut next = Vec::new();
            for &id in &step {
                for &out in &self.tasks[id].outgoing {
                    waiting[out.0] -= 1;
                    if waiting[out.0] == 0 {
                        next.push(out);
                    }
                }
            }
            steps.push(step);
            step = next;
        }
        steps
    }
}

struct Builder<'a> {
    store: &'a Store,
    tree: TaskTree,
    memo: FxHashMap<NodeId, TaskId>,
    folders: FxHashMap<EntryId, String>,
}

impl<'a> Builder<'a> {
    fn folder_path(&mut self, id: EntryId) -> anyhow::Result<String> {
        if let Some(path) = self.folders.get(&id) {
            return Ok(path.clone());
        }
        let path = self.store.get(id)?.path;
        self.folders.insert(id, path.clone());
        Ok(path)
    }

    fn create(&mut self, node: NodeId, entry: &Entry) -> anyhow::Result<TaskId> {
        assert!(
            !self.memo.contains_key(&node),
            "task for {} created twice",
            entry
        );
        let folder = match entry.folder {
            Some(id) => Some(self.folder_path(id)?),
            None => None,
        };
        let outputs = self
            .store
            .query_outputs(entry.id)?
            .into_iter()
            .map(|out| (out.id, out.path))
            .collect();
        let id = self.tree.tasks.next_id();
        self.tree.tasks.push(Task {
            id,
            node,
            entry: entry.clone(),
            folder,
            outputs,
            outgoing: Vec::new(),
            incoming: FxHashSet::default(),
        });
        self.memo.insert(node, id);
        Ok(id)
    }

    fn link(&mut self, from: TaskId, to: TaskId) {
        if self.tree.tasks[to].incoming.insert(from) {
            self.tree.tasks[from].outgoing.push(to);
        }
    }
}

/// Build the task tree for the damaged commands of `damage`.
pub fn build_from_graph(store: &Store, damage: &Damage) -> anyhow::Result<TaskTree> {
    let graph = &damage.graph;
    let mut b = Builder {
        store,
        tree: TaskTree::default(),
        memo: FxHashMap::default(),
        folders: FxHashMap::default(),
    };

    let mut work: VecDeque<(TaskId, NodeId)> = VecDeque::new();
    for node in graph.leaf_commands() {
        let task = b.create(node, &graph.node(node).entry)?;
        b.tree.leafs.push(task);
        work.push_back((task, node));
    }
    let mut max_parallel = work.len();

    while let Some((task, node)) = work.pop_front() {
        for &next in &graph.node(node).outgoing_cmds {
            let next_task = match b.memo.get(&next) {
                Some(&id) => id,
                None => {
                    let id = b.create(next, &graph.node(next).entry)?;
                    work.push_back((id, next));
                    id
                }
            };
            b.link(task, next_task);
        }
        max_parallel = max_parallel.max(work.len());
    }

    let mut tree = b.tree;
    tree.max_parallel = max_parallel.max(1);
    tracing::debug!(tasks = tree.len(), leafs = tree.leafs.len(), max_parallel, "task tree");
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::damage;
    use crate::db::Database;
    use crate::entry::NodeType;
    use crate::fs::testing::TestFileSystem;

    fn argv(s: &str) -> CommandData {
        CommandData::Command {
            argv: s.split(' ').map(|s| s.to_string()).collect(),
        }
    }

    /// Two compiles feeding one link, all never built.
    fn two_objects() -> anyhow::Result<Store> {
        let mut db = Database::open_in_memory()?;
        let obj_dir = db.add_folder("obj", None)?;
        let a = db.add_source("/s/a.c", 0.0)?;
        let b = db.add_source("/s/b.c", 0.0)?;
        let cc_a = db.add_command("cc a.c", Some(obj_dir.id), &argv("cc -c /s/a.c"), false)?;
        let cc_b = db.add_command("cc b.c", Some(obj_dir.id), &argv("cc -c /s/b.c"), false)?;
        let a_o = db.add_output(NodeType::Output, "obj/a.o", Some(obj_dir.id))?;
        let b_o = db.add_output(NodeType::Output, "obj/b.o", Some(obj_dir.id))?;
        let link = db.add_command("link app", None, &argv("ld obj/a.o obj/b.o"), false)?;
        let app = db.add_output(NodeType::Output, "app", None)?;
        db.add_strong_edge(cc_a.id, a.id)?;
        db.add_strong_edge(cc_b.id, b.id)?;
        db.add_strong_edge(a_o.id, cc_a.id)?;
        db.add_strong_edge(b_o.id, cc_b.id)?;
        db.add_strong_edge(link.id, a_o.id)?;
        db.add_strong_edge(link.id, b_o.id)?;
        db.add_strong_edge(app.id, link.id)?;
        db.commit()?;
        Ok(Store::spawn(db))
    }

    fn tree_for(store: &Store) -> anyhow::Result<TaskTree> {
        let fs = TestFileSystem::new();
        fs.touch("/s/a.c", 1.0);
        fs.touch("/s/b.c", 1.0);
        let damage = damage::compute(store, &fs)?;
        build_from_graph(store, &damage)
    }

    #[test]
    fn link_waits_for_both_compiles() -> anyhow::Result<()> {
        let store = two_objects()?;
        let tree = tree_for(&store)?;
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.leafs.len(), 2);
        assert_eq!(tree.max_parallel, 2);

        let link = tree
            .tasks
            .values()
            .find(|t| t.message() == "link app")
            .unwrap();
        assert_eq!(link.incoming.len(), 2);
        assert_eq!(link.outputs.len(), 1);
        assert_eq!(link.folder, None);
        for &leaf in &tree.leafs {
            let task = tree.task(leaf);
            assert_eq!(task.outgoing, vec![link.id]);
            assert_eq!(task.folder.as_deref(), Some("obj"));
        }

        let steps = tree.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1], vec![link.id]);
        Ok(())
    }

    #[test]
    fn message_carries_outputs() -> anyhow::Result<()> {
        let store = two_objects()?;
        let tree = tree_for(&store)?;
        let task = tree.task(tree.leafs[0]);
        let msg = task.to_message(None)?;
        assert_eq!(msg.task_type, "cmd");
        assert_eq!(msg.task_folder.as_deref(), Some("obj"));
        assert_eq!(msg.task_outputs.len(), 1);
        assert!(msg.task_outputs[0].starts_with("obj/"));
        Ok(())
    }

    #[test]
    fn empty_damage_empty_tree() -> anyhow::Result<()> {
        let store = Store::spawn(Database::open_in_memory()?);
        let tree = tree_for(&store)?;
        assert!(tree.is_empty());
        assert!(tree.leafs.is_empty());
        Ok(())
    }
}
