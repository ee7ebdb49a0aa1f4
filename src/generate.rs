//! The interface a build description generator uses to (re)write the
//! graph.
//!
//! A generator declares the whole graph on every run.  Entries are reused
//! by path, so regenerating an unchanged description leaves the store
//! untouched; anything declared differently is updated in place and marked
//! dirty, and anything no longer declared is removed by finish().

use crate::db::Database;
use crate::entry::{CommandData, Dirty, EdgeKind, Entry, EntryId, NodeType};
use crate::error::GraphError;
use anyhow::bail;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// A command as declared by the generator.
#[derive(Debug, Clone)]
pub struct NewCommand {
    /// Shown in build output; also how a command without outputs is
    /// recognized across regenerations.
    pub description: String,
    pub folder: Option<EntryId>,
    pub data: CommandData,
    pub inputs: Vec<EntryId>,
    pub weak_inputs: Vec<EntryId>,
    pub outputs: Vec<EntryId>,
    pub always: bool,
}

pub struct Generator<'a> {
    db: &'a mut Database,
    /// Where output paths live, for deleting outputs that disappear.
    root: PathBuf,
    refactor: bool,
    /// Entries declared by this generation.
    seen: FxHashSet<EntryId>,
    /// Output -> the command of this generation that produces it.
    claimed: FxHashMap<EntryId, EntryId>,
}

fn ids(entries: Vec<Entry>) -> BTreeSet<EntryId> {
    entries.into_iter().map(|e| e.id).collect()
}

impl<'a> Generator<'a> {
    pub fn new(db: &'a mut Database, root: &Path, refactor: bool) -> Self {
        Generator {
            db,
            root: root.to_path_buf(),
            refactor,
            seen: FxHashSet::default(),
            claimed: FxHashMap::default(),
        }
    }

    /// Find the entry at `path`, which must be one of `types`.
    fn existing(&self, path: &str, types: &[NodeType], requested: &str) -> anyhow::Result<Option<Entry>> {
        match self.db.find_path(path)? {
            Some(entry) if !types.contains(&entry.ty) => Err(GraphError::PathConflict {
                path: path.to_string(),
                existing: entry.ty.as_str().to_string(),
                requested: requested.to_string(),
            }
            .into()),
            found => Ok(found),
        }
    }

    fn check_new(&self, kind: &'static str, path: &str) -> anyhow::Result<()> {
        if self.refactor {
            return Err(GraphError::Refactor {
                kind,
                path: path.to_string(),
            }
            .into());
        }
        info!(kind, %path, "new");
        Ok(())
    }

    pub fn add_folder(&mut self, path: &str, parent: Option<EntryId>) -> anyhow::Result<EntryId> {
        let id = match self.existing(path, &[NodeType::Mkdir], "folder")? {
            Some(entry) => entry.id,
            None => {
                self.check_new("folder", path)?;
                self.db.add_folder(path, parent)?.id
            }
        };
        self.seen.insert(id);
        Ok(id)
    }

    /// Declare an input file.  A new source starts unstamped, so the first
    /// build sees it as changed.
    pub fn add_source(&mut self, path: &str) -> anyhow::Result<EntryId> {
        let id = match self.existing(path, &[NodeType::Source], "source")? {
            Some(entry) => entry.id,
            None => {
                self.check_new("source", path)?;
                self.db.add_source(path, 0.0)?.id
            }
        };
        self.seen.insert(id);
        Ok(id)
    }

    /// Declare a generated file.  Shared outputs may be written by more
    /// than one command.
    pub fn add_output(&mut self, path: &str, folder: Option<EntryId>, shared: bool) -> anyhow::Result<EntryId> {
        let ty = if shared {
            NodeType::SharedOutput
        } else {
            NodeType::Output
        };
        let id = match self.existing(path, &[ty], ty.as_str())? {
            Some(entry) => entry.id,
            None => {
                self.check_new("output", path)?;
                self.db.add_output(ty, path, folder)?.id
            }
        };
        self.seen.insert(id);
        Ok(id)
    }

    /// Declare a named set of entries that commands can depend on as one.
    pub fn add_group(&mut self, path: &str, members: &[EntryId]) -> anyhow::Result<EntryId> {
        let id = match self.existing(path, &[NodeType::Group], "group")? {
            Some(entry) => entry.id,
            None => {
                self.check_new("group", path)?;
                self.db.add_group(path)?.id
            }
        };
        let members: BTreeSet<EntryId> = members.iter().copied().collect();
        self.sync_edges(EdgeKind::Strong, id, &members)?;
        self.seen.insert(id);
        Ok(id)
    }

    /// Make the `kind` inputs of `id` exactly `want`, returning whether
    /// anything changed.
    fn sync_edges(&mut self, kind: EdgeKind, id: EntryId, want: &BTreeSet<EntryId>) -> anyhow::Result<bool> {
        let have = ids(self.db.query_incoming(id, kind)?);
        for &gone in have.difference(want) {
            self.db.drop_edge(kind, id, gone)?;
        }
        for &new in want.difference(&have) {
            self.db.add_edge(kind, id, new)?;
        }
        Ok(have != *want)
    }

    /// The command a previous generation stored for `cmd`, if any: the
    /// producer of its first output, or failing that an output-less
    /// command with the same description.
    fn find_command(&self, cmd: &NewCommand) -> anyhow::Result<Option<Entry>> {
        if let Some(&first) = cmd.outputs.first() {
            for producer in self.db.query_producers(first)? {
                if !self.seen.contains(&producer.id) {
                    return Ok(Some(producer));
                }
            }
        }
        for old in self.db.find_commands(&cmd.description)? {
            if !self.seen.contains(&old.id) && self.db.query_outputs(old.id)?.is_empty() {
                return Ok(Some(old));
            }
        }
        Ok(None)
    }

    pub fn add_command(&mut self, cmd: NewCommand) -> anyhow::Result<EntryId> {
        for out in &cmd.outputs {
            let entry = self.db.get(*out)?;
            if !entry.ty.is_output() {
                return Err(GraphError::PathConflict {
                    path: entry.path,
                    existing: entry.ty.as_str().to_string(),
                    requested: "output".to_string(),
                }
                .into());
            }
            if entry.ty == NodeType::Output {
                if let Some(first) = self.claimed.get(out) {
                    return Err(GraphError::DuplicateOutput {
                        path: entry.path,
                        first: self.db.get(*first)?.message(),
                        second: cmd.description.clone(),
                    }
                    .into());
                }
            }
        }

        let ty = cmd.data.node_type();
        let (id, mut changed) = match self.find_command(&cmd)? {
            Some(old) => {
                let changed =
                    old.ty != ty || old.folder != cmd.folder || old.data.as_ref() != Some(&cmd.data);
                if old.path != cmd.description {
                    self.db.rename(old.id, &cmd.description)?;
                }
                if (old.dirty == Dirty::Always) != cmd.always {
                    self.db.set_always(old.id, cmd.always)?;
                }
                (old.id, changed)
            }
            None => {
                self.check_new("command", &cmd.description)?;
                let entry = self.db.add_command(&cmd.description, cmd.folder, &cmd.data, cmd.always)?;
                (entry.id, false)
            }
        };

        let inputs: BTreeSet<EntryId> = cmd.inputs.iter().copied().collect();
        let weak: BTreeSet<EntryId> = cmd.weak_inputs.iter().copied().collect();
        changed |= self.sync_edges(EdgeKind::Strong, id, &inputs)?;
        changed |= self.sync_edges(EdgeKind::Weak, id, &weak)?;

        let outputs: BTreeSet<EntryId> = cmd.outputs.iter().copied().collect();
        let had = ids(self.db.query_outputs(id)?);
        for &gone in had.difference(&outputs) {
            self.db.drop_strong_edge(gone, id)?;
            changed = true;
        }
        for &out in outputs.difference(&had) {
            let entry = self.db.get(out)?;
            if entry.ty == NodeType::Output {
                for producer in self.db.query_producers(out)? {
                    debug!(path = %entry.path, from = %producer, "output moves to new command");
                    self.db.drop_strong_edge(out, producer.id)?;
                    self.db.mark_dirty(producer.id)?;
                }
            }
            self.db.add_strong_edge(out, id)?;
            changed = true;
        }
        for &out in &outputs {
            self.claimed.insert(out, id);
        }

        self.db.update_command(id, ty, cmd.folder, &cmd.data, changed)?;
        if changed {
            debug!(command = %cmd.description, "changed");
        }
        self.seen.insert(id);
        Ok(id)
    }

    /// Remove everything the previous generation declared that this one
    /// did not, and verify the result has no cycles.  Sources are left to
    /// the post-build sweep, since discovered headers are never declared.
    pub fn finish(self) -> anyhow::Result<()> {
        for entry in self.db.query_all()? {
            if self.seen.contains(&entry.id) {
                continue;
            }
            match entry.ty {
                NodeType::Source => continue,
                NodeType::Output | NodeType::SharedOutput => {
                    let path = self.root.join(&entry.path);
                    match std::fs::remove_file(&path) {
                        Ok(()) => info!(path = %path.display(), "removed stale output"),
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => bail!("remove {}: {}", path.display(), err),
                    }
                    self.db.drop_output(entry.id)?;
                }
                NodeType::Mkdir => self.db.drop_folder(entry.id)?,
                NodeType::Group => self.db.drop_group(entry.id)?,
                _ => self.db.drop_command(entry.id)?,
            }
            debug!(%entry, "dropped");
        }
        check_cycles(self.db)
    }
}

/// Fail with GraphError::Cycle if the stored edges contain a cycle.
pub fn check_cycles(db: &Database) -> anyhow::Result<()> {
    let edges = db.query_edges()?;
    let mut pending: FxHashMap<EntryId, usize> = FxHashMap::default();
    let mut dependents: FxHashMap<EntryId, Vec<EntryId>> = FxHashMap::default();
    for &(out, inc, _) in &edges {
        *pending.entry(out).or_default() += 1;
        pending.entry(inc).or_default();
        dependents.entry(inc).or_default().push(out);
    }
    let mut queue: VecDeque<EntryId> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(&id, _)| id)
        .collect();
    while let Some(id) = queue.pop_front() {
        pending.remove(&id);
        for &dep in dependents.get(&id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(n) = pending.get_mut(&dep) {
                *n -= 1;
                if *n == 0 {
                    queue.push_back(dep);
                }
            }
        }
    }
    if pending.is_empty() {
        return Ok(());
    }
    let mut stuck: Vec<EntryId> = pending.into_keys().collect();
    stuck.sort();
    let mut names = Vec::new();
    for id in stuck {
        names.push(db.get(id)?.message());
    }
    Err(GraphError::Cycle(names.join(", ")).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> CommandData {
        CommandData::Command {
            argv: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Declares main.c -> main.o -> main.exe.
    fn declare(gen: &mut Generator, cflags: &str) -> anyhow::Result<(EntryId, EntryId)> {
        let src = gen.add_source("/src/main.c")?;
        let obj = gen.add_output("main.o", None, false)?;
        let exe = gen.add_output("main.exe", None, false)?;
        let cc = gen.add_command(NewCommand {
            description: "cc main.c".into(),
            folder: None,
            data: argv(&["cc", cflags, "-c", "/src/main.c"]),
            inputs: vec![src],
            weak_inputs: vec![],
            outputs: vec![obj],
            always: false,
        })?;
        let link = gen.add_command(NewCommand {
            description: "link main.exe".into(),
            folder: None,
            data: argv(&["cc", "-o", "main.exe", "main.o"]),
            inputs: vec![obj],
            weak_inputs: vec![],
            outputs: vec![exe],
            always: false,
        })?;
        Ok((cc, link))
    }

    fn clean_all(db: &mut Database) -> anyhow::Result<()> {
        for entry in db.query_known_dirty()? {
            db.unmark_dirty(entry.id, entry.stamp)?;
        }
        Ok(())
    }

    #[test]
    fn regenerate_unchanged_is_quiet() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let first = declare(&mut gen, "-O0")?;
        gen.finish()?;
        assert_eq!(db.query_known_dirty()?.len(), 2);
        clean_all(&mut db)?;

        let mut gen = Generator::new(&mut db, dir.path(), true);
        assert_eq!(declare(&mut gen, "-O0")?, first);
        gen.finish()?;
        assert!(db.query_known_dirty()?.is_empty());
        Ok(())
    }

    #[test]
    fn changed_payload_marks_dirty() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let (cc, _) = declare(&mut gen, "-O0")?;
        gen.finish()?;
        clean_all(&mut db)?;

        let mut gen = Generator::new(&mut db, dir.path(), false);
        assert_eq!(declare(&mut gen, "-O2")?.0, cc);
        gen.finish()?;
        let dirty: Vec<EntryId> = db.query_known_dirty()?.into_iter().map(|e| e.id).collect();
        assert_eq!(dirty, vec![cc]);
        Ok(())
    }

    #[test]
    fn vanished_output_is_deleted() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        declare(&mut gen, "-O0")?;
        gen.finish()?;
        std::fs::write(dir.path().join("main.exe"), "")?;

        // Only the compile step remains.
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let src = gen.add_source("/src/main.c")?;
        let obj = gen.add_output("main.o", None, false)?;
        gen.add_command(NewCommand {
            description: "cc main.c".into(),
            folder: None,
            data: argv(&["cc", "-O0", "-c", "/src/main.c"]),
            inputs: vec![src],
            weak_inputs: vec![],
            outputs: vec![obj],
            always: false,
        })?;
        gen.finish()?;

        assert!(!dir.path().join("main.exe").exists());
        assert!(db.find_path("main.exe")?.is_none());
        assert!(db.find_commands("link main.exe")?.is_empty());
        Ok(())
    }

    #[test]
    fn duplicate_output() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let out = gen.add_output("gen.h", None, false)?;
        let make = |name: &str| NewCommand {
            description: name.into(),
            folder: None,
            data: argv(&[name]),
            inputs: vec![],
            weak_inputs: vec![],
            outputs: vec![out],
            always: false,
        };
        gen.add_command(make("a"))?;
        let err = gen.add_command(make("b")).unwrap_err();
        match err.downcast_ref::<GraphError>() {
            Some(GraphError::DuplicateOutput { path, first, second }) => {
                assert_eq!(path, "gen.h");
                assert_eq!(first, "a");
                assert_eq!(second, "b");
            }
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn folder_and_file_conflict() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        gen.add_folder("obj", None)?;
        let err = gen.add_output("obj", None, false).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::PathConflict { .. })
        ));
        Ok(())
    }

    #[test]
    fn refactor_rejects_new_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), true);
        let err = gen.add_source("/src/new.c").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<GraphError>(),
            Some(GraphError::Refactor { kind: "source", .. })
        ));
        Ok(())
    }

    #[test]
    fn cycle_detected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let a = gen.add_output("a", None, false)?;
        let b = gen.add_output("b", None, false)?;
        let make = |name: &str, input, output| NewCommand {
            description: name.into(),
            folder: None,
            data: argv(&[name]),
            inputs: vec![input],
            weak_inputs: vec![],
            outputs: vec![output],
            always: false,
        };
        gen.add_command(make("make-b", a, b))?;
        gen.add_command(make("make-a", b, a))?;
        let err = gen.finish().unwrap_err();
        match err.downcast_ref::<GraphError>() {
            Some(GraphError::Cycle(names)) => assert!(names.contains("make-a")),
            other => panic!("unexpected {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn always_toggle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let stamp = NewCommand {
            description: "stamp".into(),
            folder: None,
            data: argv(&["date"]),
            inputs: vec![],
            weak_inputs: vec![],
            outputs: vec![],
            always: true,
        };
        let mut gen = Generator::new(&mut db, dir.path(), false);
        let id = gen.add_command(stamp.clone())?;
        gen.finish()?;
        clean_all(&mut db)?;
        assert_eq!(db.get(id)?.dirty, Dirty::Always);

        let mut gen = Generator::new(&mut db, dir.path(), false);
        assert_eq!(gen.add_command(NewCommand { always: false, ..stamp })?, id);
        gen.finish()?;
        assert_eq!(db.get(id)?.dirty, Dirty::Known);
        Ok(())
    }
}
