//! The persisted graph model: entries (files, folders, commands) and the
//! kinds of edges between them.

use serde::{Deserialize, Serialize};

/// Row id of an entry in the store.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum NodeType {
    Source,
    Output,
    SharedOutput,
    Command,
    Cxx,
    Rc,
    Copy,
    Symlink,
    Mkdir,
    Group,
}

impl NodeType {
    pub const ALL: [NodeType; 10] = [
        NodeType::Source,
        NodeType::Output,
        NodeType::SharedOutput,
        NodeType::Command,
        NodeType::Cxx,
        NodeType::Rc,
        NodeType::Copy,
        NodeType::Symlink,
        NodeType::Mkdir,
        NodeType::Group,
    ];

    /// The name stored in the `type` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Source => "src",
            NodeType::Output => "out",
            NodeType::SharedOutput => "shared_out",
            NodeType::Command => "cmd",
            NodeType::Cxx => "cxx",
            NodeType::Rc => "rc",
            NodeType::Copy => "cp",
            NodeType::Symlink => "ln",
            NodeType::Mkdir => "mkdir",
            NodeType::Group => "group",
        }
    }

    pub fn parse(s: &str) -> Option<NodeType> {
        NodeType::ALL.iter().copied().find(|t| t.as_str() == s)
    }

    pub fn is_command(&self) -> bool {
        matches!(
            self,
            NodeType::Command | NodeType::Cxx | NodeType::Rc | NodeType::Copy | NodeType::Symlink
        )
    }

    pub fn is_output(&self) -> bool {
        matches!(self, NodeType::Output | NodeType::SharedOutput)
    }

    /// Whether entries of this type have an on-disk file whose stamp is
    /// tracked.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeType::Source) || self.is_output()
    }
}

/// Dirty state of an entry.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dirty {
    Clean,
    /// Recorded dirty in the store by an earlier run.
    Known,
    /// Found dirty by this run's damage computation.
    Computed,
    /// Re-runs every build; never cleared.
    Always,
}

impl Dirty {
    pub fn to_db(self) -> i64 {
        match self {
            Dirty::Clean => 0,
            // Once persisted, a computed dirty bit is simply known.
            Dirty::Known | Dirty::Computed => 1,
            Dirty::Always => 3,
        }
    }

    pub fn from_db(v: i64) -> Option<Dirty> {
        match v {
            0 => Some(Dirty::Clean),
            1 | 2 => Some(Dirty::Known),
            3 => Some(Dirty::Always),
            _ => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        *self != Dirty::Clean
    }
}

/// Edge kinds layered on the one (outgoing, incoming) relation, where
/// outgoing depends on incoming.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EdgeKind {
    /// Declared input: changes force the dependent dirty.
    Strong,
    /// Ordering only.
    Weak,
    /// Strong edge reported by the command itself after it ran.
    Dynamic,
}

impl EdgeKind {
    pub fn to_db(self) -> i64 {
        match self {
            EdgeKind::Strong => 0,
            EdgeKind::Weak => 1,
            EdgeKind::Dynamic => 2,
        }
    }

    pub fn from_db(v: i64) -> Option<EdgeKind> {
        match v {
            0 => Some(EdgeKind::Strong),
            1 => Some(EdgeKind::Weak),
            2 => Some(EdgeKind::Dynamic),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Strong => "strong",
            EdgeKind::Weak => "weak",
            EdgeKind::Dynamic => "dynamic",
        }
    }
}

/// How a compile step reports the headers it read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "kebab-case")]
pub enum DepsFormat {
    /// A Makefile-syntax depfile, relative to the command's folder.
    Makefile { depfile: String },
    /// MSVC `/showIncludes` notes on stdout.
    ShowIncludes {
        #[serde(default = "default_show_includes_prefix")]
        prefix: String,
    },
    /// GCC `-H` lines on stderr.
    DotPrefixed,
}

fn default_show_includes_prefix() -> String {
    crate::showincludes::DEFAULT_PREFIX.to_string()
}

/// Command-specific payload, one variant per kind of command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum CommandData {
    Command {
        argv: Vec<String>,
    },
    /// Write literal bytes to a file.
    BinWrite {
        path: String,
        contents: Vec<u8>,
    },
    Cxx {
        argv: Vec<String>,
        deps: DepsFormat,
    },
    Rc {
        /// Preprocessor run used only to discover includes.
        preprocess: Vec<String>,
        argv: Vec<String>,
        deps: DepsFormat,
    },
    Copy {
        source: String,
        dest: String,
    },
    Symlink {
        source: String,
        dest: String,
    },
}

impl CommandData {
    pub fn node_type(&self) -> NodeType {
        match self {
            CommandData::Command { .. } | CommandData::BinWrite { .. } => NodeType::Command,
            CommandData::Cxx { .. } => NodeType::Cxx,
            CommandData::Rc { .. } => NodeType::Rc,
            CommandData::Copy { .. } => NodeType::Copy,
            CommandData::Symlink { .. } => NodeType::Symlink,
        }
    }

    /// The `task_type` a worker dispatches on.
    pub fn task_type(&self) -> &'static str {
        match self {
            CommandData::Command { .. } => "cmd",
            CommandData::BinWrite { .. } => "bin",
            CommandData::Cxx { .. } => "cxx",
            CommandData::Rc { .. } => "rc",
            CommandData::Copy { .. } => "cp",
            CommandData::Symlink { .. } => "ln",
        }
    }

    /// A short human-readable rendering, used when an entry has no
    /// description of its own.
    pub fn describe(&self) -> String {
        match self {
            CommandData::Command { argv } | CommandData::Cxx { argv, .. } => argv.join(" "),
            CommandData::Rc { argv, .. } => argv.join(" "),
            CommandData::BinWrite { path, .. } => format!("write {}", path),
            CommandData::Copy { source, dest } => format!("cp {} {}", source, dest),
            CommandData::Symlink { source, dest } => format!("ln -s {} {}", source, dest),
        }
    }
}

/// A persisted graph node.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: EntryId,
    pub ty: NodeType,
    pub path: String,
    pub data: Option<CommandData>,
    pub folder: Option<EntryId>,
    pub stamp: f64,
    pub dirty: Dirty,
}

impl Entry {
    pub fn is_command(&self) -> bool {
        self.ty.is_command()
    }

    /// The text shown for this entry in build output.
    pub fn message(&self) -> String {
        match &self.data {
            Some(data) if self.path.is_empty() => data.describe(),
            _ => self.path.clone(),
        }
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ty.as_str(), self.message())
    }
}
