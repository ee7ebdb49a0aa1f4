//! Support code for e2e tests, which run stale as a binary.

mod basic;
mod discovered;
mod missing;
mod regen;

pub fn stale_binary() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_stale"))
}

pub fn stale_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(stale_binary());
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", String::from_utf8_lossy(&out.stdout));
    print!("{}", String::from_utf8_lossy(&out.stderr));
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = String::from_utf8_lossy(&out.stdout);
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

pub fn assert_output_not_contains(out: &std::process::Output, text: &str) {
    let out = String::from_utf8_lossy(&out.stdout);
    if out.contains(text) {
        panic!(
            "assertion failed; expected output to not contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// Manages a temporary directory holding a build.json and its build.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    pub fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    /// Write a file into the working space.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.path(path), content)
    }

    /// Read a file from the working space.
    pub fn read(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.path(path))
    }

    /// Move a file's mtime `secs` seconds forward.
    pub fn bump_mtime(&self, path: &str, secs: i64) -> anyhow::Result<()> {
        let path = self.path(path);
        let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&path)?);
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(mtime.unix_seconds() + secs, 0))?;
        Ok(())
    }

    /// Invoke stale, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the build failed.
    pub fn run_expect(&self, cmd: &mut std::process::Command) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("build failed, status {}", out.status);
        }
        Ok(out)
    }

    /// Write build.json and configure the build from it.
    pub fn configure(&self, build_json: &str) -> anyhow::Result<()> {
        self.write("build.json", build_json)?;
        self.run_expect(&mut stale_command(vec!["configure", "build.json"]))?;
        Ok(())
    }

    /// Persist the temp dir locally and abort the test.  Debugging helper.
    #[allow(dead_code)]
    pub fn eject(self) -> ! {
        panic!("ejected at {:?}", self.dir.into_path());
    }
}

/// main.c is "compiled" to main.o and "linked" to main.exe by copying, so
/// the tests run the same on every platform.
pub const MAIN_C: &str = r#"{
    "sources": ["main.c"],
    "commands": [
        {
            "description": "cc main.c",
            "kind": "copy", "source": "main.c", "dest": "main.o",
            "inputs": ["main.c"],
            "outputs": ["main.o"]
        },
        {
            "description": "link main.exe",
            "kind": "copy", "source": "main.o", "dest": "main.exe",
            "inputs": ["main.o"],
            "outputs": ["main.exe"]
        }
    ]
}"#;
