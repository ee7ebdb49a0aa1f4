//! Damage computation: which entries changed on disk (or were left dirty),
//! and everything downstream of them that must be redone.

use crate::densemap::{self, DenseMap};
use crate::entry::{Dirty, Entry, EntryId, NodeType};
use crate::fs::{FileSystem, MTime};
use crate::graph::{Graph, NodeId};
use crate::store::{Mutation, Store};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// An entry that starts a damage walk.
#[derive(Debug, Clone)]
pub struct Change {
    pub entry: Entry,
    /// The stamp found on disk, for files.
    pub stamp: Option<f64>,
}

/// Whether a file whose stored stamp is `stored` changed, given what is on
/// disk now.
fn file_changed(ty: NodeType, stored: f64, mtime: MTime) -> bool {
    match (ty, mtime) {
        // A missing input can't be up to date; whatever reads it reruns
        // and fails.
        (NodeType::Source, MTime::Missing) => true,
        // Outputs never stamped belong to commands that never completed,
        // which are dirty in their own right.
        (_, _) if ty.is_output() && stored == 0.0 => false,
        (_, mtime) => mtime.as_stamp() != stored,
    }
}

/// Find the entries that changed since the last build: files whose stamp
/// differs from disk, plus commands stored as dirty.  A changed output
/// also dirties the command producing it.  Results are in id order.
pub fn find_changed(store: &Store, fs: &dyn FileSystem) -> anyhow::Result<Vec<Change>> {
    let files = store.query_files()?;
    let stats = files
        .par_iter()
        .map(|entry| fs.stat(&entry.path))
        .collect::<std::io::Result<Vec<MTime>>>()?;

    let mut changed: BTreeMap<EntryId, Change> = BTreeMap::new();
    for (entry, mtime) in files.into_iter().zip(stats) {
        if !file_changed(entry.ty, entry.stamp, mtime) {
            continue;
        }
        debug!(path = %entry.path, stored = entry.stamp, disk = mtime.as_stamp(), "changed");
        if entry.ty.is_output() {
            for producer in store.query_producers(entry.id)? {
                changed.entry(producer.id).or_insert(Change {
                    entry: producer,
                    stamp: None,
                });
            }
        }
        changed.insert(
            entry.id,
            Change {
                entry,
                stamp: Some(mtime.as_stamp()),
            },
        );
    }
    for entry in store.query_known_dirty()? {
        changed.entry(entry.id).or_insert(Change { entry, stamp: None });
    }
    Ok(changed.into_values().collect())
}

/// Id for DamageNode structures in a DamageGraph.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DamageId(usize);
impl densemap::Index for DamageId {
    fn index(&self) -> usize {
        self.0
    }
}
impl From<usize> for DamageId {
    fn from(u: usize) -> DamageId {
        DamageId(u)
    }
}

#[derive(Debug)]
pub struct DamageNode {
    pub node: NodeId,
    pub children: Vec<DamageId>,
    pub parents: Vec<DamageId>,
    /// Parents not yet satisfied.
    pub unmet: usize,
}

/// The damaged part of a Graph, as parent -> child links along dependents.
#[derive(Default)]
pub struct DamageGraph {
    pub nodes: DenseMap<DamageId, DamageNode>,
    by_node: FxHashMap<NodeId, DamageId>,
    /// Last pass that walked from each node.
    visited: FxHashMap<NodeId, u32>,
    visit: u32,
}

impl DamageGraph {
    pub fn build(graph: &Graph) -> Self {
        let mut damage = DamageGraph::default();
        damage.extend(graph, &graph.leafs);
        damage
    }

    pub fn lookup(&self, node: NodeId) -> Option<DamageId> {
        self.by_node.get(&node).copied()
    }

    fn memo(&mut self, node: NodeId) -> DamageId {
        if let Some(id) = self.lookup(node) {
            return id;
        }
        let id = self.nodes.push(DamageNode {
            node,
            children: Vec::new(),
            parents: Vec::new(),
            unmet: 0,
        });
        self.by_node.insert(node, id);
        id
    }

    fn link(&mut self, parent: DamageId, child: DamageId) {
        if self.nodes[parent].children.contains(&child) {
            return;
        }
        self.nodes[parent].children.push(child);
        let child = &mut self.nodes[child];
        child.parents.push(parent);
        child.unmet += 1;
    }

    /// Walk depth-first from `starts` along dependents, in one pass.
    pub fn extend(&mut self, graph: &Graph, starts: &[NodeId]) {
        self.visit += 1;
        let visit = self.visit;
        let mut stack: Vec<NodeId> = starts.iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            if self.visited.insert(node, visit) == Some(visit) {
                continue;
            }
            let parent = self.memo(node);
            for &dep in graph.node(node).outgoing.iter().rev() {
                let child = self.memo(dep);
                self.link(parent, child);
                stack.push(dep);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> Vec<DamageId> {
        self.nodes
            .all_ids()
            .filter(|&id| self.nodes[id].parents.is_empty())
            .collect()
    }

    /// All nodes, each after all of its parents.
    pub fn ordered(&self) -> Vec<DamageId> {
        let mut unmet: Vec<usize> = self.nodes.values().map(|n| n.unmet).collect();
        let mut ready = self.roots();
        ready.reverse();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for &child in self.nodes[id].children.iter().rev() {
                let n = &mut unmet[child.0];
                *n -= 1;
                if *n == 0 {
                    ready.push(child);
                }
            }
        }
        order
    }

    /// Print the damage tree from its roots, one node per line.  Nodes
    /// reached a second time are not expanded again.
    pub fn print(&self, graph: &Graph, out: &mut dyn std::io::Write) -> std::io::Result<()> {
        let mut printed = vec![false; self.nodes.len()];
        for root in self.roots() {
            self.print_node(graph, root, 0, &mut printed, out)?;
        }
        Ok(())
    }

    fn print_node(
        &self,
        graph: &Graph,
        id: DamageId,
        depth: usize,
        printed: &mut [bool],
        out: &mut dyn std::io::Write,
    ) -> std::io::Result<()> {
        let node = &self.nodes[id];
        let entry = &graph.node(node.node).entry;
        if printed[id.0] && !node.children.is_empty() {
            writeln!(out, "{:indent$}{} ...", "", entry, indent = depth * 2)?;
            return Ok(());
        }
        printed[id.0] = true;
        writeln!(out, "{:indent$}{}", "", entry, indent = depth * 2)?;
        for &child in &node.children {
            self.print_node(graph, child, depth + 1, printed, out)?;
        }
        Ok(())
    }
}

pub struct Damage {
    pub graph: Graph,
    pub changed: Vec<Change>,
    pub damage: DamageGraph,
}

impl Damage {
    /// Damaged commands, in id order.
    pub fn commands(&self) -> Vec<&Entry> {
        let mut cmds: Vec<&Entry> = self
            .graph
            .commands()
            .map(|id| &self.graph.node(id).entry)
            .collect();
        cmds.sort_by_key(|e| e.id);
        cmds
    }

    /// Record the damage in the store before anything runs: damaged
    /// commands become dirty, changed files get their new stamps.  If the
    /// build then dies, the next one still knows what to redo.
    pub fn persist(&self, store: &Store) -> anyhow::Result<()> {
        for id in self.graph.commands() {
            let entry = &self.graph.node(id).entry;
            if entry.dirty != Dirty::Known && entry.dirty != Dirty::Always {
                store.apply(Mutation::MarkDirty(entry.id))?;
            }
        }
        for change in &self.changed {
            if let Some(stamp) = change.stamp {
                store.apply(Mutation::UnmarkDirty(change.entry.id, stamp))?;
            }
        }
        store.commit()
    }
}

pub fn compute(store: &Store, fs: &dyn FileSystem) -> anyhow::Result<Damage> {
    let changed = find_changed(store, fs)?;
    let mut graph = Graph::new();
    for change in &changed {
        graph.add_leaf(change.entry.clone());
    }
    graph.integrate(store)?;

    let cmds: Vec<NodeId> = graph.commands().collect();
    for id in cmds {
        let entry = &mut graph.node_mut(id).entry;
        if entry.dirty == Dirty::Clean {
            entry.dirty = Dirty::Computed;
        }
    }

    let damage = DamageGraph::build(&graph);
    info!(
        changed = changed.len(),
        damaged = damage.len(),
        commands = graph.commands().count(),
        "damage"
    );
    Ok(Damage {
        graph,
        changed,
        damage,
    })
}
