//! Dependencies reported by commands after they run.

use crate::e2e::*;

#[cfg(unix)]
fn compile_with_depfile(deps: &str) -> String {
    format!(
        r#"{{
        "sources": ["main.c"],
        "commands": [
            {{
                "description": "cc main.c",
                "kind": "cxx",
                "argv": ["sh", "-c", "cp main.c main.o && echo 'main.o: {}' > main.d"],
                "deps": {{"format": "makefile", "depfile": "main.d"}},
                "inputs": ["main.c"],
                "outputs": ["main.o"]
            }}
        ]
    }}"#,
        deps
    )
}

#[cfg(unix)]
#[test]
fn absolute_header_becomes_source() -> anyhow::Result<()> {
    let include = tempfile::tempdir()?;
    let header = include.path().join("stdio.h");
    std::fs::write(&header, "")?;
    let header = header.to_string_lossy().into_owned();

    let space = TestSpace::new()?;
    space.configure(&compile_with_depfile(&format!("main.c {}", header)))?;
    space.write("main.c", "")?;
    space.run_expect(&mut stale_command(vec![]))?;

    let out = space.run_expect(&mut stale_command(vec!["--show-graph"]))?;
    assert_output_contains(&out, &format!("src {}", header));
    assert_output_contains(&out, "  <- dynamic");

    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "no work to do");

    let mtime = filetime::FileTime::from_last_modification_time(&std::fs::metadata(&header)?);
    filetime::set_file_mtime(&header, filetime::FileTime::from_unix_time(mtime.unix_seconds() + 10, 0))?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}

#[cfg(unix)]
#[test]
fn bad_depfile() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(
        r#"{
        "commands": [
            {
                "description": "gen",
                "kind": "cxx",
                "argv": ["sh", "-c", "touch out && echo 'garbage text' > out.d"],
                "deps": {"format": "makefile", "depfile": "out.d"},
                "outputs": ["out"]
            }
        ]
    }"#,
    )?;
    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "parse error");
    Ok(())
}

#[cfg(unix)]
#[test]
fn undeclared_generated_input() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("main.c", "")?;
    space.configure(&compile_with_depfile("main.c generated.h"))?;
    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "generated.h is used by cc main.c but is not declared as an output");
    Ok(())
}
