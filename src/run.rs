//! Command-line entry point and the top-level build sequence.

use crate::config::{BuildConfig, Options, ShowMode};
use crate::db::Database;
use crate::fs::RealFileSystem;
use crate::ipc::Backend;
use crate::master::{BuildStatus, MasterOptions, TaskMaster};
use crate::progress::{ConsoleProgress, Progress};
use crate::store::Store;
use crate::{damage, load, logging, show, signal, trace, tree, worker};
use anyhow::{anyhow, bail};
use argh::FromArgs;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Name of the build database, in the build directory.
pub const DB_FILE: &str = ".stale.db";

#[derive(FromArgs)]
/// stale, an incremental build engine.
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// number of workers [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// fail if anything new would be added to the graph
    #[argh(switch)]
    refactor: bool,

    /// print the stored graph and exit
    #[argh(switch)]
    show_graph: bool,

    /// print what changed since the last build and exit
    #[argh(switch)]
    show_changed: bool,

    /// print the damage tree and exit
    #[argh(switch)]
    show_damage: bool,

    /// print the commands that would run and exit
    #[argh(switch)]
    show_commands: bool,

    /// print the commands grouped by parallel step and exit
    #[argh(switch)]
    show_steps: bool,

    /// print full command lines and more log output
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools (use "list" for a list)
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// where tasks run: "thread" (default) or "process"
    #[argh(option)]
    workers: Option<String>,

    #[argh(subcommand)]
    command: Option<Command>,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Command {
    Configure(ConfigureArgs),
    Worker(WorkerArgs),
}

#[derive(FromArgs)]
/// Generate the graph from a build description.
#[argh(subcommand, name = "configure")]
struct ConfigureArgs {
    /// path to build.json
    #[argh(positional)]
    script: String,
}

#[derive(FromArgs)]
/// Run tasks read from stdin (used by --workers=process).
#[argh(subcommand, name = "worker")]
struct WorkerArgs {}

impl Args {
    fn show_mode(&self) -> anyhow::Result<Option<ShowMode>> {
        let modes = [
            (self.show_graph, ShowMode::Graph),
            (self.show_changed, ShowMode::Changed),
            (self.show_damage, ShowMode::Damage),
            (self.show_commands, ShowMode::Commands),
            (self.show_steps, ShowMode::Steps),
        ];
        let mut chosen = modes.iter().filter(|(on, _)| *on).map(|&(_, mode)| mode);
        let mode = chosen.next();
        if chosen.next().is_some() {
            bail!("only one --show-* flag may be given");
        }
        Ok(mode)
    }

    fn options(&self) -> anyhow::Result<Options> {
        let mut options = Options {
            refactor: self.refactor,
            show: self.show_mode()?,
            verbose: self.verbose,
            ..Options::default()
        };
        if let Some(jobs) = self.jobs {
            if jobs == 0 {
                bail!("invalid -j 0");
            }
            options.jobs = jobs;
        }
        options.backend = match self.workers.as_deref() {
            None | Some("thread") => Backend::Thread,
            Some("process") => Backend::Process(std::env::current_exe()?),
            Some(other) => bail!("unknown --workers {:?}, expected thread or process", other),
        };
        Ok(options)
    }
}

/// The result of a build that got to run.
#[derive(Debug)]
pub struct Summary {
    pub status: BuildStatus,
    pub tasks_run: usize,
    /// The first task that failed.
    pub failure: Option<String>,
}

/// Print one of the --show-* views of the build rooted at `root`.
pub fn show(store: &Store, root: &Path, mode: ShowMode, out: &mut dyn std::io::Write) -> anyhow::Result<()> {
    if mode == ShowMode::Graph {
        return show::graph(store, out);
    }
    let damage = damage::compute(store, &RealFileSystem::rooted(root))?;
    match mode {
        ShowMode::Changed => show::changed(&damage, out),
        ShowMode::Damage => show::damage(&damage, out),
        _ => {
            let tree = tree::build_from_graph(store, &damage)?;
            if mode == ShowMode::Steps {
                show::steps(&tree, out)
            } else {
                show::commands(&tree, out)
            }
        }
    }
}

/// Bring the build rooted at `root` up to date: compute damage, record it,
/// run the damaged commands, and sweep sources nothing uses anymore.  The
/// store is committed whatever the outcome.
pub fn build(
    store: &Store,
    root: &Path,
    options: &Options,
    tools_env: Option<BTreeMap<String, String>>,
    progress: &mut dyn Progress,
) -> anyhow::Result<Summary> {
    let fs = RealFileSystem::rooted(root);
    let damage = trace::scope("damage", || damage::compute(store, &fs))?;
    let tree = trace::scope("tree", || tree::build_from_graph(store, &damage))?;
    damage.persist(store)?;
    drop(damage);

    let master_options = MasterOptions {
        jobs: options.jobs,
        refactor: options.refactor,
        backend: options.backend.clone(),
        tools_env,
        interrupt: signal::flag(),
    };
    let mut master = TaskMaster::new(store, tree, progress, master_options, root);
    let result = trace::scope("run", || master.run());
    let summary = Summary {
        status: master.status(),
        tasks_run: master.tasks_run(),
        failure: master.failure().map(str::to_string),
    };
    drop(master);
    store.commit()?;
    result?;

    if summary.status.is_success() {
        let swept = store.call(|db| {
            let unused = db.query_unreferenced_sources()?;
            for entry in &unused {
                db.drop_source(entry.id)?;
            }
            Ok(unused.len())
        })?;
        if swept > 0 {
            info!(swept, "dropped unused sources");
        }
        store.commit()?;
    }
    Ok(summary)
}

/// Open the database, making sure the graph is configured and current.
fn open(root: &Path, args: &Args, options: &Options) -> anyhow::Result<(Database, BuildConfig)> {
    let mut db = Database::open(&root.join(DB_FILE))?;
    if let Some(Command::Configure(configure)) = &args.command {
        let config = trace::scope("configure", || {
            load::configure(&mut db, Path::new(&configure.script), root, options.refactor)
        })?;
        return Ok((db, config));
    }
    let config = BuildConfig::load(&db)?
        .ok_or_else(|| anyhow!("not configured; run `stale configure <build.json>` first"))?;
    if config.needs_reconfigure(&RealFileSystem::new())? {
        let script = config
            .scripts
            .first()
            .ok_or_else(|| anyhow!("no build script recorded"))?
            .path
            .clone();
        let config = trace::scope("configure", || {
            load::configure(&mut db, Path::new(&script), root, options.refactor)
        })?;
        return Ok((db, config));
    }
    Ok((db, config))
}

fn run_impl(args: Args) -> anyhow::Result<i32> {
    if let Some(Command::Worker(_)) = args.command {
        worker::serve_stdio()?;
        return Ok(0);
    }
    logging::init(args.verbose)?;

    if let Some(debug) = &args.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }
    let root = std::env::current_dir()?;
    let options = args.options()?;

    let (db, config) = open(&root, &args, &options)?;
    if let Some(Command::Configure(_)) = args.command {
        println!("stale: configured {}", config.build_path);
        return Ok(0);
    }

    let store = Store::spawn(db);
    if let Some(mode) = options.show {
        let mut stdout = std::io::stdout().lock();
        show(&store, &root, mode, &mut stdout)?;
        return Ok(0);
    }

    signal::register_sigint();
    let mut progress = ConsoleProgress::new(options.verbose);
    let summary = build(&store, &root, &options, config.tools_env(), &mut progress)?;
    store.close()?;

    Ok(match summary.status {
        BuildStatus::NoChanges => {
            println!("stale: no work to do");
            0
        }
        BuildStatus::Succeeded => {
            println!("stale: ran {} tasks, now up to date", summary.tasks_run);
            0
        }
        BuildStatus::Interrupted => {
            println!("stale: interrupted");
            2
        }
        // Don't print any summary, the failing task is enough info.
        BuildStatus::Failed | BuildStatus::InProgress => 1,
    })
}

pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    let res = run_impl(args);
    trace::close()?;
    res
}
