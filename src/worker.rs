//! Executes one task: runs its command (or file operation), checks that the
//! declared outputs exist, and reports their new stamps along with any
//! dependencies the command discovered.
//!
//! Workers know nothing about the graph; a task message carries everything
//! needed.  All paths in it are relative to the build root.

use crate::canon::canon_dep_path;
use crate::depfile;
use crate::entry::{CommandData, DepsFormat};
use crate::fs::{stat, MTime};
use crate::message::{FromWorker, ResultsMessage, TaskMessage, ToWorker};
use crate::scanner::Scanner;
use crate::showincludes;
use anyhow::{anyhow, Context};
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Console output and discovered dependencies of a finished task.
#[derive(Default)]
struct Outcome {
    ok: bool,
    stdout: String,
    stderr: String,
    deps: Option<Vec<String>>,
}

impl Outcome {
    fn ok() -> Self {
        Outcome {
            ok: true,
            ..Default::default()
        }
    }
}

struct Job<'a> {
    root: &'a Path,
    task: &'a TaskMessage,
    cwd: PathBuf,
}

/// Deletes a file; not-found is fine.
fn remove_stale(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

fn create_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Runs an argv in the task's folder, capturing its output.
fn run_argv(
    cwd: &Path,
    argv: &[String],
    env: Option<&BTreeMap<String, String>>,
) -> anyhow::Result<Outcome> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command line"))?;
    let mut cmd = std::process::Command::new(program);
    cmd.args(args).current_dir(cwd);
    if let Some(env) = env {
        cmd.envs(env);
    }
    let output = cmd.output().with_context(|| format!("spawn {}", program))?;
    let mut outcome = Outcome {
        ok: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        deps: None,
    };
    if !outcome.ok {
        note_signal(&output.status, &mut outcome.stderr);
    }
    Ok(outcome)
}

#[cfg(unix)]
fn note_signal(status: &std::process::ExitStatus, stderr: &mut String) {
    use std::os::unix::process::ExitStatusExt;
    if let Some(sig) = status.signal() {
        match sig {
            libc::SIGINT => stderr.push_str("interrupted\n"),
            _ => stderr.push_str(&format!("signal {}\n", sig)),
        }
    }
}

#[cfg(not(unix))]
fn note_signal(_status: &std::process::ExitStatus, _stderr: &mut String) {}

/// Reads dependencies from a .d file path.
fn read_depfile(path: &Path) -> anyhow::Result<Vec<String>> {
    let bytes = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let mut scanner = Scanner::new(&bytes);
    let parsed = depfile::parse(&mut scanner)
        .map_err(|err| anyhow!(scanner.format_parse_error(path, err)))?;
    Ok(parsed.deps)
}

impl<'a> Job<'a> {
    fn env(&self) -> Option<&BTreeMap<String, String>> {
        self.task.tools_env.as_ref()
    }

    fn in_folder(&self, path: &str) -> PathBuf {
        self.cwd.join(path)
    }

    /// Runs a compile whose dependencies are reported in `format`.
    fn compile(&self, argv: &[String], format: &DepsFormat) -> anyhow::Result<Outcome> {
        if let DepsFormat::Makefile { depfile } = format {
            remove_stale(&self.in_folder(depfile))?;
        }
        let mut outcome = run_argv(&self.cwd, argv, self.env())?;
        let deps = match format {
            DepsFormat::Makefile { depfile } => {
                if !outcome.ok {
                    return Ok(outcome);
                }
                read_depfile(&self.in_folder(depfile))?
            }
            DepsFormat::ShowIncludes { prefix } => {
                let filtered = showincludes::parse_show_includes(&outcome.stdout, prefix);
                outcome.stdout = filtered.output;
                filtered.deps
            }
            DepsFormat::DotPrefixed => {
                let filtered = showincludes::parse_dot_prefixed(&outcome.stderr);
                outcome.stderr = filtered.output;
                filtered.deps
            }
        };
        let folder = self.task.task_folder.as_deref();
        outcome.deps = Some(
            deps.iter()
                .map(|dep| canon_dep_path(self.root, folder, dep))
                .collect(),
        );
        Ok(outcome)
    }

    fn run(&self) -> anyhow::Result<Outcome> {
        match &self.task.task_data {
            CommandData::Command { argv } => run_argv(&self.cwd, argv, self.env()),
            CommandData::BinWrite { path, contents } => {
                let path = self.in_folder(path);
                create_parent_dir(&path)?;
                std::fs::write(&path, contents)
                    .with_context(|| format!("write {}", path.display()))?;
                Ok(Outcome::ok())
            }
            CommandData::Cxx { argv, deps } => self.compile(argv, deps),
            CommandData::Rc {
                preprocess,
                argv,
                deps,
            } => {
                // Only the preprocessor reports includes.
                let pre = self.compile(preprocess, deps)?;
                if !pre.ok {
                    return Ok(pre);
                }
                let mut outcome = run_argv(&self.cwd, argv, self.env())?;
                outcome.deps = pre.deps;
                Ok(outcome)
            }
            CommandData::Copy { source, dest } => {
                let dest = self.in_folder(dest);
                create_parent_dir(&dest)?;
                std::fs::copy(self.in_folder(source), &dest)
                    .with_context(|| format!("copy {} to {}", source, dest.display()))?;
                Ok(Outcome::ok())
            }
            CommandData::Symlink { source, dest } => {
                let dest = self.in_folder(dest);
                create_parent_dir(&dest)?;
                remove_stale(&dest)?;
                symlink(Path::new(source), &dest)
                    .with_context(|| format!("symlink {} to {}", dest.display(), source))?;
                Ok(Outcome::ok())
            }
        }
    }
}

#[cfg(unix)]
fn symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn symlink(source: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}

fn execute_impl(root: &Path, task: &TaskMessage) -> anyhow::Result<ResultsMessage> {
    for out in &task.task_outputs {
        let path = root.join(out);
        remove_stale(&path)?;
        create_parent_dir(&path)?;
    }
    let cwd = match &task.task_folder {
        Some(folder) => {
            let cwd = root.join(folder);
            std::fs::create_dir_all(&cwd).with_context(|| format!("create {}", folder))?;
            cwd
        }
        None => root.to_path_buf(),
    };

    let ctx = Job { root, task, cwd };
    let mut outcome = ctx.run()?;

    let mut updates = Vec::new();
    if outcome.ok {
        for out in &task.task_outputs {
            let path = root.join(out);
            match stat(&path)? {
                MTime::Stamp(t) => updates.push((out.clone(), t)),
                MTime::Missing => {
                    outcome.ok = false;
                    outcome
                        .stderr
                        .push_str(&format!("stale: output {} missing after command\n", out));
                }
            }
        }
    }
    if !outcome.ok {
        updates.clear();
        outcome.deps = None;
    }

    Ok(ResultsMessage {
        task_id: task.task_id,
        ok: outcome.ok,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        updates,
        deps: outcome.deps,
    })
}

/// Runs `task` with the build root at `root`.  Failures outside the command
/// itself (a file that can't be removed, a depfile that doesn't parse) fail
/// the task too.
pub fn execute(root: &Path, task: &TaskMessage) -> ResultsMessage {
    debug!(task_id = task.task_id, task_type = %task.task_type, "execute");
    execute_impl(root, task).unwrap_or_else(|err| {
        ResultsMessage::failure(task.task_id, format!("stale: {:#}", err))
    })
}

/// Serve tasks arriving as JSON lines on `input`, answering on `output`,
/// until `input` closes.
pub fn serve(root: &Path, input: impl BufRead, mut output: impl Write) -> anyhow::Result<()> {
    let mut send = |msg: &FromWorker| -> anyhow::Result<()> {
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        output.write_all(line.as_bytes())?;
        output.flush()?;
        Ok(())
    };
    send(&FromWorker::Spawned)?;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let msg: ToWorker =
            serde_json::from_str(&line).with_context(|| format!("bad task message {:?}", line))?;
        match msg {
            ToWorker::Task(task) => send(&FromWorker::Results(execute(root, &task)))?,
        }
    }
    Ok(())
}

/// Entry point of `stale worker`.
pub fn serve_stdio() -> anyhow::Result<()> {
    let root = std::env::current_dir()?;
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    serve(&root, stdin.lock(), stdout.lock())
}
