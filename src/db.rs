//! The build database persists the dependency graph (entries and edges),
//! dirty bits and stamps, and the configuration variables of the build.
//!
//! Mutations accumulate in one open transaction which is only committed by
//! an explicit commit(); a crash before that leaves the previous state,
//! and the next build simply redoes the work.

use crate::entry::{CommandData, Dirty, EdgeKind, Entry, EntryId, NodeType};
use crate::error::GraphError;
use anyhow::{anyhow, bail, Context};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;

const SCHEMA_VERSION: &str = "2";

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS nodes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        type TEXT NOT NULL,
        path TEXT NOT NULL,
        folder_id INTEGER,
        stamp REAL NOT NULL DEFAULT 0.0,
        dirty INTEGER NOT NULL DEFAULT 0,
        data TEXT
    );
    CREATE UNIQUE INDEX IF NOT EXISTS node_paths ON nodes(path)
        WHERE type NOT IN ('cmd', 'cxx', 'rc', 'cp', 'ln');
    CREATE INDEX IF NOT EXISTS node_dirty ON nodes(dirty);
    CREATE TABLE IF NOT EXISTS edges (
        outgoing INTEGER NOT NULL,
        incoming INTEGER NOT NULL,
        kind INTEGER NOT NULL,
        PRIMARY KEY (outgoing, incoming, kind)
    );
    CREATE INDEX IF NOT EXISTS edge_incoming ON edges(incoming);
    CREATE TABLE IF NOT EXISTS vars (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
"#;

const NODE_COLUMNS: &str = "n.id, n.type, n.path, n.folder_id, n.stamp, n.dirty, n.data";
const COMMAND_TYPES: &str = "('cmd', 'cxx', 'rc', 'cp', 'ln')";
const FILE_TYPES: &str = "('src', 'out', 'shared_out')";

/// A node row as read from SQLite, before validation.
struct RawEntry {
    id: i64,
    ty: String,
    path: String,
    folder: Option<i64>,
    stamp: f64,
    dirty: i64,
    data: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row) -> rusqlite::Result<RawEntry> {
        Ok(RawEntry {
            id: row.get(0)?,
            ty: row.get(1)?,
            path: row.get(2)?,
            folder: row.get(3)?,
            stamp: row.get(4)?,
            dirty: row.get(5)?,
            data: row.get(6)?,
        })
    }
}

/// Build an Entry from its persisted columns, validating them.
pub fn import_node(
    ty: &str,
    path: String,
    id: i64,
    stamp: f64,
    dirty: i64,
    data: Option<&str>,
    folder: Option<i64>,
) -> anyhow::Result<Entry> {
    let ty = NodeType::parse(ty).ok_or_else(|| anyhow!("entry #{}: unknown type {:?}", id, ty))?;
    let dirty =
        Dirty::from_db(dirty).ok_or_else(|| anyhow!("entry #{}: bad dirty value {}", id, dirty))?;
    let data = match data {
        None => None,
        Some(json) => Some(
            serde_json::from_str::<CommandData>(json)
                .with_context(|| format!("entry #{}: bad command data", id))?,
        ),
    };
    if ty.is_command() != data.is_some() {
        bail!("entry #{}: {} entry with mismatched command data", id, ty.as_str());
    }
    Ok(Entry {
        id: EntryId(id),
        ty,
        path,
        data,
        folder: folder.map(EntryId),
        stamp,
        dirty,
    })
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (creating if needed) the database at `path`.  Anything that
    /// prevents reading it is reported as corruption.
    pub fn open(path: &Path) -> anyhow::Result<Database> {
        let conn =
            Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        Self::init(conn).map_err(|err| {
            GraphError::Corrupt(format!("{}: {:#}", path.display(), err)).into()
        })
    }

    pub fn open_in_memory() -> anyhow::Result<Database> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Database> {
        conn.execute_batch(SCHEMA)?;
        let mut db = Database { conn };
        match db.get_var("schema_version")? {
            None => db.set_var("schema_version", SCHEMA_VERSION)?,
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => bail!("unknown schema version {:?}", v),
        }
        db.commit()?;
        Ok(db)
    }

    fn begin(&self) -> rusqlite::Result<()> {
        if self.conn.is_autocommit() {
            self.conn.execute_batch("BEGIN IMMEDIATE")?;
        }
        Ok(())
    }

    /// Make all mutations since the last commit durable.
    pub fn commit(&mut self) -> anyhow::Result<()> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT").context("commit build database")?;
        }
        Ok(())
    }

    fn query_entries<P: rusqlite::Params>(&self, sql: &str, params: P) -> anyhow::Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, RawEntry::from_row)?;
        let mut entries = Vec::new();
        for raw in rows {
            let raw = raw?;
            entries.push(import_node(
                &raw.ty,
                raw.path,
                raw.id,
                raw.stamp,
                raw.dirty,
                raw.data.as_deref(),
                raw.folder,
            )?);
        }
        Ok(entries)
    }

    fn query_ids<P: rusqlite::Params>(&self, sql: &str, params: P) -> anyhow::Result<Vec<EntryId>> {
        let mut stmt = self.conn.prepare_cached(sql)?;
        let rows = stmt.query_map(params, |row| row.get::<_, i64>(0))?;
        let mut ids = Vec::new();
        for id in rows {
            ids.push(EntryId(id?));
        }
        Ok(ids)
    }

    pub fn get(&self, id: EntryId) -> anyhow::Result<Entry> {
        let sql = format!("SELECT {} FROM nodes n WHERE n.id = ?1", NODE_COLUMNS);
        self.query_entries(&sql, params![id.0])?
            .pop()
            .ok_or_else(|| anyhow!("no entry {}", id))
    }

    /// Look up a file, folder or group entry by path.
    pub fn find_path(&self, path: &str) -> anyhow::Result<Option<Entry>> {
        let sql = format!(
            "SELECT {} FROM nodes n WHERE n.path = ?1 AND n.type NOT IN {}",
            NODE_COLUMNS, COMMAND_TYPES
        );
        Ok(self.query_entries(&sql, params![path])?.pop())
    }

    /// Entries that depend on `id` through strong or dynamic edges.
    pub fn query_outgoing(&self, id: EntryId) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT DISTINCT {} FROM edges e JOIN nodes n ON n.id = e.outgoing \
             WHERE e.incoming = ?1 AND e.kind != ?2 ORDER BY n.id",
            NODE_COLUMNS
        );
        self.query_entries(&sql, params![id.0, EdgeKind::Weak.to_db()])
    }

    /// Entries that must wait for `id` without being dirtied by it.
    pub fn query_weak_outgoing(&self, id: EntryId) -> anyhow::Result<Vec<EntryId>> {
        self.query_ids(
            "SELECT outgoing FROM edges WHERE incoming = ?1 AND kind = ?2 ORDER BY outgoing",
            params![id.0, EdgeKind::Weak.to_db()],
        )
    }

    /// Entries `id` depends on through edges of `kind`.
    pub fn query_incoming(&self, id: EntryId, kind: EdgeKind) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM edges e JOIN nodes n ON n.id = e.incoming \
             WHERE e.outgoing = ?1 AND e.kind = ?2 ORDER BY n.id",
            NODE_COLUMNS
        );
        self.query_entries(&sql, params![id.0, kind.to_db()])
    }

    /// Files a command produces.
    pub fn query_outputs(&self, cmd: EntryId) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT DISTINCT {} FROM edges e JOIN nodes n ON n.id = e.outgoing \
             WHERE e.incoming = ?1 AND n.type IN ('out', 'shared_out') ORDER BY n.id",
            NODE_COLUMNS
        );
        self.query_entries(&sql, params![cmd.0])
    }

    /// Commands that produce the output `id`.
    pub fn query_producers(&self, id: EntryId) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT DISTINCT {} FROM edges e JOIN nodes n ON n.id = e.incoming \
             WHERE e.outgoing = ?1 AND n.type IN {} ORDER BY n.id",
            NODE_COLUMNS, COMMAND_TYPES
        );
        self.query_entries(&sql, params![id.0])
    }

    pub fn query_dynamic_deps(&self, cmd: EntryId) -> anyhow::Result<Vec<EntryId>> {
        self.query_ids(
            "SELECT incoming FROM edges WHERE outgoing = ?1 AND kind = ?2 ORDER BY incoming",
            params![cmd.0, EdgeKind::Dynamic.to_db()],
        )
    }

    /// Whether `to` transitively depends on `from`, through edges of any kind.
    pub fn query_path(&self, from: EntryId, to: EntryId) -> anyhow::Result<bool> {
        let mut stmt = self.conn.prepare_cached(
            "WITH RECURSIVE reach(id) AS ( \
                 SELECT ?1 \
                 UNION \
                 SELECT e.outgoing FROM edges e JOIN reach r ON e.incoming = r.id \
             ) SELECT 1 FROM reach WHERE id = ?2 LIMIT 1",
        )?;
        Ok(stmt
            .query_row(params![from.0, to.0], |_| Ok(()))
            .optional()?
            .is_some())
    }

    /// Entries a previous run left dirty, plus always-dirty ones.
    pub fn query_known_dirty(&self) -> anyhow::Result<Vec<Entry>> {
        let sql = format!("SELECT {} FROM nodes n WHERE n.dirty != 0 ORDER BY n.id", NODE_COLUMNS);
        self.query_entries(&sql, [])
    }

    /// Entries with an on-disk file whose stamp is tracked.
    pub fn query_files(&self) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM nodes n WHERE n.type IN {} ORDER BY n.id",
            NODE_COLUMNS, FILE_TYPES
        );
        self.query_entries(&sql, [])
    }

    /// Commands with the given description.
    pub fn find_commands(&self, path: &str) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM nodes n WHERE n.path = ?1 AND n.type IN {} ORDER BY n.id",
            NODE_COLUMNS, COMMAND_TYPES
        );
        self.query_entries(&sql, params![path])
    }

    pub fn query_all(&self) -> anyhow::Result<Vec<Entry>> {
        let sql = format!("SELECT {} FROM nodes n ORDER BY n.id", NODE_COLUMNS);
        self.query_entries(&sql, [])
    }

    pub fn query_edges(&self) -> anyhow::Result<Vec<(EntryId, EntryId, EdgeKind)>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT outgoing, incoming, kind FROM edges ORDER BY outgoing, incoming, kind")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;
        let mut edges = Vec::new();
        for row in rows {
            let (out, inc, kind) = row?;
            let kind = EdgeKind::from_db(kind)
                .ok_or_else(|| anyhow!("edge #{} -> #{}: bad kind {}", out, inc, kind))?;
            edges.push((EntryId(out), EntryId(inc), kind));
        }
        Ok(edges)
    }

    /// Sources nothing depends on anymore.
    pub fn query_unreferenced_sources(&self) -> anyhow::Result<Vec<Entry>> {
        let sql = format!(
            "SELECT {} FROM nodes n WHERE n.type = 'src' \
             AND NOT EXISTS (SELECT 1 FROM edges e WHERE e.incoming = n.id) ORDER BY n.id",
            NODE_COLUMNS
        );
        self.query_entries(&sql, [])
    }

    fn insert_node(
        &mut self,
        ty: NodeType,
        path: &str,
        folder: Option<EntryId>,
        data: Option<&CommandData>,
        stamp: f64,
        dirty: Dirty,
    ) -> anyhow::Result<Entry> {
        self.begin()?;
        let json = match data {
            Some(data) => Some(serde_json::to_string(data)?),
            None => None,
        };
        self.conn
            .prepare_cached(
                "INSERT INTO nodes (type, path, folder_id, stamp, dirty, data) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?
            .execute(params![
                ty.as_str(),
                path,
                folder.map(|f| f.0),
                stamp,
                dirty.to_db(),
                json
            ])
            .with_context(|| format!("add {} {}", ty.as_str(), path))?;
        Ok(Entry {
            id: EntryId(self.conn.last_insert_rowid()),
            ty,
            path: path.to_string(),
            data: data.cloned(),
            folder,
            stamp,
            dirty,
        })
    }

    pub fn add_source(&mut self, path: &str, stamp: f64) -> anyhow::Result<Entry> {
        self.insert_node(NodeType::Source, path, None, None, stamp, Dirty::Clean)
    }

    pub fn add_output(
        &mut self,
        ty: NodeType,
        path: &str,
        folder: Option<EntryId>,
    ) -> anyhow::Result<Entry> {
        assert!(ty.is_output());
        self.insert_node(ty, path, folder, None, 0.0, Dirty::Clean)
    }

    pub fn add_folder(&mut self, path: &str, parent: Option<EntryId>) -> anyhow::Result<Entry> {
        self.insert_node(NodeType::Mkdir, path, parent, None, 0.0, Dirty::Clean)
    }

    pub fn add_group(&mut self, path: &str) -> anyhow::Result<Entry> {
        self.insert_node(NodeType::Group, path, None, None, 0.0, Dirty::Clean)
    }

    /// New commands start dirty: they have never run.
    pub fn add_command(
        &mut self,
        path: &str,
        folder: Option<EntryId>,
        data: &CommandData,
        always: bool,
    ) -> anyhow::Result<Entry> {
        let dirty = if always { Dirty::Always } else { Dirty::Known };
        self.insert_node(data.node_type(), path, folder, Some(data), 0.0, dirty)
    }

    pub fn mark_dirty(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("UPDATE nodes SET dirty = 1 WHERE id = ?1 AND dirty = 0")?
            .execute(params![id.0])?;
        Ok(())
    }

    /// Record that `id` is up to date as of `stamp`.  Always-dirty entries
    /// keep their state.
    pub fn unmark_dirty(&mut self, id: EntryId, stamp: f64) -> anyhow::Result<()> {
        self.begin()?;
        let n = self
            .conn
            .prepare_cached(
                "UPDATE nodes SET stamp = ?2, dirty = CASE WHEN dirty = 3 THEN 3 ELSE 0 END \
                 WHERE id = ?1",
            )?
            .execute(params![id.0, stamp])?;
        if n == 0 {
            bail!("no entry {}", id);
        }
        Ok(())
    }

    pub fn rename(&mut self, id: EntryId, path: &str) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("UPDATE nodes SET path = ?2 WHERE id = ?1")?
            .execute(params![id.0, path])?;
        Ok(())
    }

    /// Switch a command between always-dirty and normal.  A command
    /// leaving the always state stays dirty for one more run.
    pub fn set_always(&mut self, id: EntryId, always: bool) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached(
                "UPDATE nodes SET dirty = CASE WHEN ?2 THEN 3 WHEN dirty = 3 THEN 1 ELSE dirty END \
                 WHERE id = ?1",
            )?
            .execute(params![id.0, always])?;
        Ok(())
    }

    /// Edges of different kinds between the same pair are independent.
    pub fn add_edge(&mut self, kind: EdgeKind, outgoing: EntryId, incoming: EntryId) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO edges (outgoing, incoming, kind) VALUES (?1, ?2, ?3)")?
            .execute(params![outgoing.0, incoming.0, kind.to_db()])?;
        Ok(())
    }

    pub fn drop_edge(&mut self, kind: EdgeKind, outgoing: EntryId, incoming: EntryId) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("DELETE FROM edges WHERE outgoing = ?1 AND incoming = ?2 AND kind = ?3")?
            .execute(params![outgoing.0, incoming.0, kind.to_db()])?;
        Ok(())
    }

    pub fn add_strong_edge(&mut self, outgoing: EntryId, incoming: EntryId) -> anyhow::Result<()> {
        self.add_edge(EdgeKind::Strong, outgoing, incoming)
    }

    pub fn drop_strong_edge(&mut self, outgoing: EntryId, incoming: EntryId) -> anyhow::Result<()> {
        self.drop_edge(EdgeKind::Strong, outgoing, incoming)
    }

    /// Replace a command's type, folder and payload, optionally marking it
    /// dirty so it reruns.
    pub fn update_command(
        &mut self,
        id: EntryId,
        ty: NodeType,
        folder: Option<EntryId>,
        data: &CommandData,
        dirty: bool,
    ) -> anyhow::Result<()> {
        self.begin()?;
        let json = serde_json::to_string(data)?;
        let n = self
            .conn
            .prepare_cached(
                "UPDATE nodes SET type = ?2, folder_id = ?3, data = ?4, \
                 dirty = CASE WHEN ?5 AND dirty = 0 THEN 1 ELSE dirty END WHERE id = ?1",
            )?
            .execute(params![id.0, ty.as_str(), folder.map(|f| f.0), json, dirty])?;
        if n == 0 {
            bail!("no entry {}", id);
        }
        Ok(())
    }

    fn drop_node(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("DELETE FROM edges WHERE outgoing = ?1 OR incoming = ?1")?
            .execute(params![id.0])?;
        self.conn
            .prepare_cached("DELETE FROM nodes WHERE id = ?1")?
            .execute(params![id.0])?;
        Ok(())
    }

    pub fn drop_output(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.drop_node(id)
    }

    pub fn drop_command(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.drop_node(id)
    }

    pub fn drop_source(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.drop_node(id)
    }

    pub fn drop_group(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.drop_node(id)
    }

    pub fn drop_folder(&mut self, id: EntryId) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("UPDATE nodes SET folder_id = NULL WHERE folder_id = ?1")?
            .execute(params![id.0])?;
        self.drop_node(id)
    }

    pub fn get_var(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .conn
            .prepare_cached("SELECT value FROM vars WHERE key = ?1")?
            .query_row(params![key], |row| row.get(0))
            .optional()?)
    }

    pub fn set_var(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.begin()?;
        self.conn
            .prepare_cached("INSERT OR REPLACE INTO vars (key, value) VALUES (?1, ?2)")?
            .execute(params![key, value])?;
        Ok(())
    }
}
