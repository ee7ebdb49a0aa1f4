//! Build configuration: what is recorded in the database about how the
//! build was configured, and the knobs a single invocation runs with.

use crate::db::Database;
use crate::fs::FileSystem;
use crate::ipc::Backend;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// A file the build graph was generated from, with its stamp at the time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub path: String,
    pub stamp: f64,
}

/// Configuration persisted in the `vars` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildConfig {
    pub source_path: String,
    pub build_path: String,
    /// Environment passed to every task.
    pub env: BTreeMap<String, String>,
    pub scripts: Vec<Script>,
}

impl BuildConfig {
    /// The recorded configuration, or None if the build was never
    /// configured.
    pub fn load(db: &Database) -> anyhow::Result<Option<BuildConfig>> {
        let source_path = match db.get_var("source_path")? {
            None => return Ok(None),
            Some(path) => path,
        };
        let build_path = db.get_var("build_path")?.unwrap_or_default();
        let env = match db.get_var("env")? {
            Some(json) => serde_json::from_str(&json).context("bad env var")?,
            None => BTreeMap::new(),
        };
        let scripts = match db.get_var("scripts")? {
            Some(json) => serde_json::from_str(&json).context("bad scripts var")?,
            None => Vec::new(),
        };
        Ok(Some(BuildConfig {
            source_path,
            build_path,
            env,
            scripts,
        }))
    }

    pub fn save(&self, db: &mut Database) -> anyhow::Result<()> {
        db.set_var("source_path", &self.source_path)?;
        db.set_var("build_path", &self.build_path)?;
        db.set_var("env", &serde_json::to_string(&self.env)?)?;
        db.set_var("scripts", &serde_json::to_string(&self.scripts)?)?;
        Ok(())
    }

    /// Whether any build script changed since the graph was generated.
    pub fn needs_reconfigure(&self, fs: &dyn FileSystem) -> anyhow::Result<bool> {
        for script in &self.scripts {
            let stamp = fs.stat(&script.path)?.as_stamp();
            if stamp != script.stamp {
                info!(script = %script.path, "changed, reconfiguring");
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The environment to hand to tasks, if any.
    pub fn tools_env(&self) -> Option<BTreeMap<String, String>> {
        if self.env.is_empty() {
            None
        } else {
            Some(self.env.clone())
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ShowMode {
    Graph,
    Changed,
    Damage,
    Commands,
    Steps,
}

/// Per-invocation settings.
#[derive(Debug, Clone)]
pub struct Options {
    pub jobs: usize,
    /// Treat anything new showing up in the graph as an error.
    pub refactor: bool,
    pub show: Option<ShowMode>,
    pub verbose: bool,
    pub backend: Backend,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            jobs: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            refactor: false,
            show: None,
            verbose: false,
            backend: Backend::Thread,
        }
    }
}
