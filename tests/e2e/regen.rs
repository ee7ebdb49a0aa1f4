//! Tests around reconfiguring when build.json changes.

use crate::e2e::*;

const WITH_BACKUP: &str = r#"{
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
        },
        {
            "description": "backup main.exe",
            "kind": "copy", "source": "main.exe", "dest": "main.bak",
            "inputs": ["main.exe"],
            "outputs": ["main.bak"]
        }
    ]
}"#;

#[test]
fn edited_description_is_reloaded() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("main.c", "x")?;
    space.run_expect(&mut stale_command(vec![]))?;

    // A new command: only it runs.
    space.write("build.json", WITH_BACKUP)?;
    space.bump_mtime("build.json", 10)?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "backup main.exe");
    assert_output_not_contains(&out, "cc main.c");
    assert_output_contains(&out, "ran 1 tasks");
    assert_eq!(space.read("main.bak")?, "x");

    // Removing it again deletes what it produced.
    space.write("build.json", MAIN_C)?;
    space.bump_mtime("build.json", 20)?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "no work to do");
    assert!(space.read("main.bak").is_err());
    Ok(())
}

#[test]
fn refactor_rejects_new_commands() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("build.json", WITH_BACKUP)?;
    space.bump_mtime("build.json", 10)?;
    let out = space.run(&mut stale_command(vec!["--refactor"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "refactoring: new output main.bak");
    Ok(())
}
