//! The --show-* modes: print some stage of the engine instead of building.

use crate::damage::Damage;
use crate::entry::{EntryId, NodeType};
use crate::store::Store;
use crate::tree::TaskTree;
use rustc_hash::FxHashMap;
use std::io::Write;

/// Every entry, each followed by what it depends on.
pub fn graph(store: &Store, out: &mut dyn Write) -> anyhow::Result<()> {
    let (entries, edges) = store.call(|db| Ok((db.query_all()?, db.query_edges()?)))?;
    let mut deps: FxHashMap<EntryId, Vec<_>> = FxHashMap::default();
    for (outgoing, incoming, kind) in edges {
        deps.entry(outgoing).or_default().push((incoming, kind));
    }
    let names: FxHashMap<EntryId, String> = entries.iter().map(|e| (e.id, e.message())).collect();
    for entry in &entries {
        write!(out, "{} {} {}", entry.id, entry.ty.as_str(), entry.message())?;
        if entry.ty.is_file() {
            write!(out, " @{}", entry.stamp)?;
        }
        if entry.dirty.is_dirty() {
            write!(out, " ({:?})", entry.dirty)?;
        }
        writeln!(out)?;
        for (dep, kind) in deps.get(&entry.id).map(Vec::as_slice).unwrap_or(&[]) {
            let name = names.get(dep).map(String::as_str).unwrap_or("?");
            writeln!(out, "  <- {} {} {}", kind.as_str(), dep, name)?;
        }
    }
    Ok(())
}

pub fn changed(damage: &Damage, out: &mut dyn Write) -> anyhow::Result<()> {
    for change in &damage.changed {
        match change.stamp {
            Some(stamp) => writeln!(out, "{} @{}", change.entry, stamp)?,
            None if change.entry.ty == NodeType::Source => writeln!(out, "{} missing", change.entry)?,
            None => writeln!(out, "{} ({:?})", change.entry, change.entry.dirty)?,
        }
    }
    Ok(())
}

pub fn damage(damage: &Damage, out: &mut dyn Write) -> anyhow::Result<()> {
    damage.damage.print(&damage.graph, out)?;
    Ok(())
}

/// Tasks in creation order.
pub fn commands(tree: &TaskTree, out: &mut dyn Write) -> anyhow::Result<()> {
    for task in tree.tasks.values() {
        let folder = task.folder.as_deref().unwrap_or(".");
        let data = task.data()?;
        writeln!(out, "{}: [{}] {} ({})", task.id.as_usize(), folder, task.message(), data.describe())?;
    }
    Ok(())
}

/// Tasks grouped by the step of an unbounded scheduler they would run in.
pub fn steps(tree: &TaskTree, out: &mut dyn Write) -> anyhow::Result<()> {
    for (n, step) in tree.steps().iter().enumerate() {
        writeln!(out, "step {}:", n + 1)?;
        for &id in step {
            writeln!(out, "  {}", tree.task(id).message())?;
        }
    }
    writeln!(out, "max parallel: {}", tree.max_parallel)?;
    Ok(())
}
