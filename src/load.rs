//! Graph loading: reads a build.json description and declares its contents
//! through the generator.

use crate::canon::canon_path;
use crate::config::{BuildConfig, Script};
use crate::db::Database;
use crate::entry::{CommandData, EntryId};
use crate::fs;
use crate::generate::{Generator, NewCommand};
use anyhow::{anyhow, Context};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct CommandDesc {
    #[serde(default)]
    pub description: Option<String>,
    /// Working directory, relative to the build root.  Must be listed in
    /// `folders`.
    #[serde(default)]
    pub folder: Option<String>,
    #[serde(flatten)]
    pub data: CommandData,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub weak_inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub shared_outputs: Vec<String>,
    #[serde(default)]
    pub always: bool,
}

/// The contents of a build.json.  Output and folder paths are relative to
/// the build root; source paths are relative to the directory holding the
/// description.
#[derive(Debug, Default, Deserialize)]
pub struct BuildDescription {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
    /// Group name -> member paths.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub commands: Vec<CommandDesc>,
}

/// Resolves the paths of a description to entries while declaring it.
struct Loader<'a, 'g> {
    gen: &'a mut Generator<'g>,
    /// Directory relative source paths are resolved against.
    base: &'a Path,
    folders: FxHashMap<String, EntryId>,
    /// Declared outputs and groups, by path.
    generated: FxHashMap<String, EntryId>,
}

impl<'a, 'g> Loader<'a, 'g> {
    fn source_path(&self, path: &str) -> String {
        if Path::new(path).is_absolute() {
            canon_path(path)
        } else {
            canon_path(&self.base.join(path).to_string_lossy())
        }
    }

    /// The folder entry for the directory holding `path`, if declared.
    fn parent_folder(&self, path: &str) -> Option<EntryId> {
        let parent = Path::new(path).parent()?.to_str()?;
        self.folders.get(parent).copied()
    }

    fn folder(&self, path: &Option<String>) -> anyhow::Result<Option<EntryId>> {
        match path {
            None => Ok(None),
            Some(path) => {
                let path = canon_path(path);
                self.folders
                    .get(&path)
                    .copied()
                    .map(Some)
                    .ok_or_else(|| anyhow!("folder {:?} is not declared", path))
            }
        }
    }

    /// An input names a declared output or group if it matches one, and
    /// otherwise a source.
    fn input(&mut self, path: &str) -> anyhow::Result<EntryId> {
        if let Some(&id) = self.generated.get(&canon_path(path)) {
            return Ok(id);
        }
        let path = self.source_path(path);
        self.gen.add_source(&path)
    }

    fn inputs(&mut self, paths: &[String]) -> anyhow::Result<Vec<EntryId>> {
        paths.iter().map(|p| self.input(p)).collect()
    }

    fn load(&mut self, desc: &BuildDescription) -> anyhow::Result<()> {
        let mut folders: Vec<String> = desc.folders.iter().map(|f| canon_path(f)).collect();
        folders.sort_by_key(|f| f.matches('/').count());
        for path in folders {
            let parent = self.parent_folder(&path);
            let id = self.gen.add_folder(&path, parent)?;
            self.folders.insert(path, id);
        }

        for path in &desc.sources {
            let path = self.source_path(path);
            self.gen.add_source(&path)?;
        }

        for cmd in &desc.commands {
            for (paths, shared) in [(&cmd.outputs, false), (&cmd.shared_outputs, true)] {
                for path in paths {
                    let path = canon_path(path);
                    if self.generated.contains_key(&path) {
                        // Declared by an earlier command; add_command
                        // reports the clash.
                        continue;
                    }
                    let folder = self.parent_folder(&path);
                    let id = self.gen.add_output(&path, folder, shared)?;
                    self.generated.insert(path, id);
                }
            }
        }

        for (name, members) in &desc.groups {
            let members = self.inputs(members)?;
            let name = canon_path(name);
            let id = self.gen.add_group(&name, &members)?;
            self.generated.insert(name, id);
        }

        for cmd in &desc.commands {
            let mut outputs = Vec::new();
            for path in cmd.outputs.iter().chain(&cmd.shared_outputs) {
                let path = canon_path(path);
                let id = self
                    .generated
                    .get(&path)
                    .ok_or_else(|| anyhow!("output {} was not declared", path))?;
                outputs.push(*id);
            }
            let new = NewCommand {
                description: cmd
                    .description
                    .clone()
                    .unwrap_or_else(|| cmd.data.describe()),
                folder: self.folder(&cmd.folder)?,
                data: cmd.data.clone(),
                inputs: self.inputs(&cmd.inputs)?,
                weak_inputs: self.inputs(&cmd.weak_inputs)?,
                outputs,
                always: cmd.always,
            };
            self.gen.add_command(new)?;
        }
        Ok(())
    }
}

impl BuildDescription {
    pub fn parse(json: &str) -> anyhow::Result<BuildDescription> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn read(path: &Path) -> anyhow::Result<BuildDescription> {
        let json = std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        Self::parse(&json).with_context(|| format!("parse {}", path.display()))
    }

    /// Declare everything in the description.  `base` is the directory
    /// relative source paths are resolved against.
    pub fn declare(&self, gen: &mut Generator, base: &Path) -> anyhow::Result<()> {
        let mut loader = Loader {
            gen,
            base,
            folders: FxHashMap::default(),
            generated: FxHashMap::default(),
        };
        loader.load(self)
    }
}

/// (Re)generate the graph in `db` from the description at `script`, for a
/// build rooted at `root`, and record the configuration.  Nothing is
/// committed on error.
pub fn configure(db: &mut Database, script: &Path, root: &Path, refactor: bool) -> anyhow::Result<BuildConfig> {
    let script = if script.is_absolute() {
        script.to_path_buf()
    } else {
        std::env::current_dir()?.join(script)
    };
    let desc = BuildDescription::read(&script)?;
    let base = script
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", script.display()))?;

    let mut gen = Generator::new(db, root, refactor);
    desc.declare(&mut gen, base)?;
    gen.finish()?;

    let script_path = script.to_string_lossy().into_owned();
    let config = BuildConfig {
        source_path: base.to_string_lossy().into_owned(),
        build_path: root.to_string_lossy().into_owned(),
        env: desc.env,
        scripts: vec![Script {
            stamp: fs::stat(&script)?.as_stamp(),
            path: script_path,
        }],
    };
    config.save(db)?;
    db.commit()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{DepsFormat, EdgeKind, NodeType};

    const DESC: &str = r#"{
        "env": {"CC": "cc"},
        "folders": ["obj"],
        "sources": ["main.c"],
        "groups": {"headers": ["gen/config.h"]},
        "commands": [
            {
                "description": "gen config.h",
                "kind": "bin-write",
                "path": "gen/config.h",
                "contents": [35, 10],
                "outputs": ["gen/config.h"]
            },
            {
                "description": "cc main.c",
                "folder": "obj",
                "kind": "cxx",
                "argv": ["cc", "-MD", "-MF", "main.d", "-c", "../../src/main.c"],
                "deps": {"format": "makefile", "depfile": "main.d"},
                "inputs": ["main.c"],
                "weak_inputs": ["headers"],
                "outputs": ["obj/main.o"]
            }
        ]
    }"#;

    #[test]
    fn parse_description() -> anyhow::Result<()> {
        let desc = BuildDescription::parse(DESC)?;
        assert_eq!(desc.commands.len(), 2);
        match &desc.commands[1].data {
            CommandData::Cxx {
                deps: DepsFormat::Makefile { depfile },
                ..
            } => assert_eq!(depfile, "main.d"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(BuildDescription::parse(r#"{"commands": [{"kind": "nope"}]}"#).is_err());
        Ok(())
    }

    #[test]
    fn declare_resolves_paths() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let desc = BuildDescription::parse(DESC)?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        desc.declare(&mut gen, Path::new("/src"))?;
        gen.finish()?;

        let src = db.find_path("/src/main.c")?.expect("source");
        assert_eq!(src.ty, NodeType::Source);
        let obj = db.find_path("obj/main.o")?.expect("output");
        assert!(obj.folder.is_some());
        let cc = &db.query_producers(obj.id)?[0];
        assert_eq!(cc.path, "cc main.c");
        assert_eq!(cc.folder, obj.folder);
        let weak = db.query_incoming(cc.id, EdgeKind::Weak)?;
        assert_eq!(weak[0].ty, NodeType::Group);
        let members = db.query_incoming(weak[0].id, EdgeKind::Strong)?;
        assert_eq!(members[0].path, "gen/config.h");
        Ok(())
    }

    #[test]
    fn undeclared_folder() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut db = Database::open_in_memory()?;
        let desc = BuildDescription::parse(
            r#"{"commands": [{"kind": "command", "argv": ["true"], "folder": "nope"}]}"#,
        )?;
        let mut gen = Generator::new(&mut db, dir.path(), false);
        assert!(desc.declare(&mut gen, Path::new("/src")).is_err());
        Ok(())
    }

    #[test]
    fn configure_records_script() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("build.json");
        std::fs::write(&script, DESC)?;
        let mut db = Database::open_in_memory()?;
        let config = configure(&mut db, &script, dir.path(), false)?;
        assert_eq!(config.env["CC"], "cc");
        assert_eq!(BuildConfig::load(&db)?, Some(config.clone()));
        assert!(!config.needs_reconfigure(&crate::fs::RealFileSystem::new())?);
        Ok(())
    }
}
