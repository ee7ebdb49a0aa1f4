//! The in-memory build graph: the part of the persisted graph reachable
//! from the entries that changed, with command-to-command reachability
//! maintained incrementally as edges are added.

use crate::densemap::{self, DenseMap};
use crate::entry::{EdgeKind, Entry, EntryId};
use crate::store::Store;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Id for GraphNode structures in the graph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct NodeId(usize);
impl densemap::Index for NodeId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for NodeId {
    fn from(u: usize) -> NodeId {
        NodeId(u)
    }
}

/// An entry together with its adjacency in this build.
///
/// `incoming_cmds` holds, for any node, the nearest commands upstream of
/// it: for a file, the commands whose work it transitively carries; for a
/// command, the commands that must finish before it can run.
/// `outgoing_cmds` is the inverse, only maintained on commands.
#[derive(Debug)]
pub struct GraphNode {
    pub entry: Entry,
    /// Nodes this one depends on.
    pub incoming: BTreeSet<NodeId>,
    /// Nodes depending on this one through strong or dynamic edges.
    pub outgoing: BTreeSet<NodeId>,
    /// Nodes that must wait for this one but are not dirtied by it.
    pub weak_outgoing: BTreeSet<NodeId>,
    pub incoming_cmds: BTreeSet<NodeId>,
    pub outgoing_cmds: BTreeSet<NodeId>,
}

impl GraphNode {
    fn new(entry: Entry) -> Self {
        GraphNode {
            entry,
            incoming: BTreeSet::new(),
            outgoing: BTreeSet::new(),
            weak_outgoing: BTreeSet::new(),
            incoming_cmds: BTreeSet::new(),
            outgoing_cmds: BTreeSet::new(),
        }
    }

    pub fn is_command(&self) -> bool {
        self.entry.is_command()
    }
}

#[derive(Default)]
pub struct Graph {
    pub nodes: DenseMap<NodeId, GraphNode>,
    by_entry: FxHashMap<EntryId, NodeId>,
    /// Nodes the graph was grown from.
    pub leafs: Vec<NodeId>,
    /// Imported nodes whose dependents are not imported yet.
    pending: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn lookup(&self, id: EntryId) -> Option<NodeId> {
        self.by_entry.get(&id).copied()
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut GraphNode {
        &mut self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Add `entry` if not present yet, queueing it for integrate().
    pub fn import_node(&mut self, entry: Entry) -> NodeId {
        if let Some(id) = self.lookup(entry.id) {
            return id;
        }
        let entry_id = entry.id;
        let id = self.nodes.push(GraphNode::new(entry));
        self.by_entry.insert(entry_id, id);
        self.pending.push(id);
        id
    }

    /// Add `entry` as one of the starting points of the graph.
    pub fn add_leaf(&mut self, entry: Entry) -> NodeId {
        let id = self.import_node(entry);
        if !self.leafs.contains(&id) {
            self.leafs.push(id);
        }
        id
    }

    /// Record that `to` depends on `from` and propagate which commands
    /// now reach `to`.
    pub fn add_edge(&mut self, from: NodeId, to: NodeId) {
        if !self.nodes[from].outgoing.insert(to) {
            return;
        }
        self.nodes[to].incoming.insert(from);
        let seed = self.reaching_cmds(from);
        self.propagate(to, seed);
    }

    /// Record that `to` must wait for `from` without being dirtied by it.
    pub fn add_weak_edge(&mut self, from: NodeId, to: NodeId) {
        if self.nodes[from].outgoing.contains(&to) || !self.nodes[from].weak_outgoing.insert(to) {
            return;
        }
        self.nodes[to].incoming.insert(from);
        let seed = self.reaching_cmds(from);
        self.propagate(to, seed);
    }

    /// The commands a dependent of `id` must wait for.
    fn reaching_cmds(&self, id: NodeId) -> BTreeSet<NodeId> {
        let node = &self.nodes[id];
        if node.is_command() {
            BTreeSet::from([id])
        } else {
            node.incoming_cmds.clone()
        }
    }

    /// Push `cmds` downstream from `start`.  Commands absorb the set and
    /// stop the walk; other nodes pass on only what they did not already
    /// have, so each node is revisited only while its set keeps growing.
    fn propagate(&mut self, start: NodeId, cmds: BTreeSet<NodeId>) {
        let mut work = vec![(start, cmds)];
        while let Some((id, cmds)) = work.pop() {
            if self.nodes[id].is_command() {
                for cmd in cmds {
                    if cmd != id && self.nodes[id].incoming_cmds.insert(cmd) {
                        self.nodes[cmd].outgoing_cmds.insert(id);
                    }
                }
                continue;
            }
            let node = &mut self.nodes[id];
            let grown: BTreeSet<NodeId> = cmds.difference(&node.incoming_cmds).copied().collect();
            if grown.is_empty() {
                continue;
            }
            node.incoming_cmds.extend(grown.iter().copied());
            for &next in node.outgoing.iter().chain(node.weak_outgoing.iter()) {
                work.push((next, grown.clone()));
            }
        }
    }

    /// Import everything that depends on a pending node, then connect the
    /// imported nodes through their weak edges.
    pub fn integrate(&mut self, store: &Store) -> anyhow::Result<()> {
        let mut imported = Vec::new();
        while let Some(id) = self.pending.pop() {
            imported.push(id);
            let entry_id = self.nodes[id].entry.id;
            for dependent in store.query_outgoing(entry_id)? {
                let dep = self.import_node(dependent);
                self.add_edge(id, dep);
            }
        }
        // Weak edges are looked up from both ends, since either end may
        // have been imported by an earlier integrate().
        for &id in &imported {
            let entry_id = self.nodes[id].entry.id;
            for waiter in store.query_weak_outgoing(entry_id)? {
                if let Some(to) = self.lookup(waiter) {
                    self.add_weak_edge(id, to);
                }
            }
            for before in store.query_incoming(entry_id, EdgeKind::Weak)? {
                if let Some(from) = self.lookup(before.id) {
                    self.add_weak_edge(from, id);
                }
            }
        }
        debug!(imported = imported.len(), nodes = self.len(), "integrate");
        Ok(())
    }

    /// Commands with no command that must run before them.
    pub fn leaf_commands(&self) -> Vec<NodeId> {
        self.nodes
            .all_ids()
            .filter(|&id| {
                let node = &self.nodes[id];
                node.is_command() && node.incoming_cmds.is_empty()
            })
            .collect()
    }

    pub fn commands(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.all_ids().filter(|&id| self.nodes[id].is_command())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::entry::{CommandData, Dirty, NodeType};

    pub fn file(id: i64, path: &str) -> Entry {
        Entry {
            id: EntryId(id),
            ty: NodeType::Output,
            path: path.to_string(),
            data: None,
            folder: None,
            stamp: 0.0,
            dirty: Dirty::Clean,
        }
    }

    pub fn cmd(id: i64, name: &str) -> Entry {
        Entry {
            id: EntryId(id),
            ty: NodeType::Command,
            path: name.to_string(),
            data: Some(CommandData::Command {
                argv: vec![name.to_string()],
            }),
            folder: None,
            stamp: 0.0,
            dirty: Dirty::Clean,
        }
    }

    fn ids(set: &BTreeSet<NodeId>) -> Vec<NodeId> {
        set.iter().copied().collect()
    }

    #[test]
    fn diamond() {
        // gen -> {a.h, b.h}; cc depends on both headers.
        let mut g = Graph::new();
        let gen = g.add_leaf(cmd(1, "gen"));
        let a = g.import_node(file(2, "a.h"));
        let b = g.import_node(file(3, "b.h"));
        let cc = g.import_node(cmd(4, "cc"));
        g.add_edge(gen, a);
        g.add_edge(gen, b);
        g.add_edge(a, cc);
        g.add_edge(b, cc);

        assert_eq!(ids(&g.node(cc).incoming_cmds), vec![gen]);
        assert_eq!(ids(&g.node(gen).outgoing_cmds), vec![cc]);
        assert_eq!(g.leaf_commands(), vec![gen]);
    }

    #[test]
    fn late_edge_reaches_visited_nodes() {
        // Wire x.h -> cc first, then connect the generator to x.h.
        let mut g = Graph::new();
        let x = g.import_node(file(1, "x.h"));
        let cc = g.import_node(cmd(2, "cc"));
        let obj = g.import_node(file(3, "x.o"));
        let link = g.import_node(cmd(4, "link"));
        g.add_edge(x, cc);
        g.add_edge(cc, obj);
        g.add_edge(obj, link);
        assert_eq!(g.leaf_commands(), vec![cc]);

        let gen = g.import_node(cmd(5, "gen"));
        g.add_edge(gen, x);
        assert_eq!(ids(&g.node(cc).incoming_cmds), vec![gen]);
        assert_eq!(ids(&g.node(link).incoming_cmds), vec![cc]);
        assert_eq!(g.leaf_commands(), vec![gen]);
    }

    #[test]
    fn chained_files_carry_commands() {
        // Two producers feed one file through an intermediate file.
        let mut g = Graph::new();
        let p1 = g.import_node(cmd(1, "p1"));
        let p2 = g.import_node(cmd(2, "p2"));
        let mid = g.import_node(file(3, "mid"));
        let end = g.import_node(file(4, "end"));
        let c = g.import_node(cmd(5, "c"));
        g.add_edge(mid, end);
        g.add_edge(end, c);
        g.add_edge(p1, mid);
        g.add_edge(p2, mid);
        assert_eq!(ids(&g.node(c).incoming_cmds), vec![p1, p2]);
        assert_eq!(ids(&g.node(p2).outgoing_cmds), vec![c]);
        // Adding an edge twice changes nothing.
        g.add_edge(p1, mid);
        assert_eq!(g.node(mid).incoming.len(), 2);
    }

    #[test]
    fn weak_edges_order_commands() {
        let mut g = Graph::new();
        let gen = g.import_node(cmd(1, "gen"));
        let out = g.import_node(file(2, "gen.out"));
        let user = g.import_node(cmd(3, "user"));
        g.add_edge(gen, out);
        g.add_weak_edge(out, user);
        assert_eq!(ids(&g.node(user).incoming_cmds), vec![gen]);
        assert!(g.node(out).outgoing.is_empty());
    }

    #[test]
    fn integrate_imports_dependents() -> anyhow::Result<()> {
        use crate::db::Database;

        let mut db = Database::open_in_memory()?;
        let src = db.add_source("/s/main.c", 0.0)?;
        let other = db.add_source("/s/other.c", 0.0)?;
        let data = CommandData::Command {
            argv: vec!["cc".into()],
        };
        let cc = db.add_command("cc main.c", None, &data, false)?;
        let obj = db.add_output(NodeType::Output, "main.o", None)?;
        let link = db.add_command("link", None, &data, false)?;
        let exe = db.add_output(NodeType::Output, "main.exe", None)?;
        let unrelated = db.add_command("cc other.c", None, &data, false)?;
        db.add_strong_edge(cc.id, src.id)?;
        db.add_strong_edge(obj.id, cc.id)?;
        db.add_strong_edge(link.id, obj.id)?;
        db.add_strong_edge(exe.id, link.id)?;
        db.add_strong_edge(unrelated.id, other.id)?;
        db.add_edge(EdgeKind::Weak, unrelated.id, obj.id)?;
        let store = Store::spawn(db);

        let mut g = Graph::new();
        g.add_leaf(store.get(src.id)?);
        g.integrate(&store)?;
        assert_eq!(g.len(), 5);
        assert!(g.lookup(unrelated.id).is_none());
        let cc_node = g.lookup(cc.id).unwrap();
        let link_node = g.lookup(link.id).unwrap();
        assert_eq!(g.leaf_commands(), vec![cc_node]);
        assert_eq!(ids(&g.node(cc_node).outgoing_cmds), vec![link_node]);

        // A later leaf pulls in the weak waiter too.
        g.add_leaf(store.get(other.id)?);
        g.integrate(&store)?;
        let unrelated_node = g.lookup(unrelated.id).unwrap();
        assert_eq!(ids(&g.node(unrelated_node).incoming_cmds), vec![cc_node]);
        Ok(())
    }
}
