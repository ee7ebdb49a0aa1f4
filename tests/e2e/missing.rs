//! Tests for behavior around missing files.

use super::*;

#[test]
fn missing_source_then_created() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;

    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());

    space.write("main.c", "x")?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "ran 2 tasks");
    Ok(())
}

#[test]
fn deleted_output_is_rebuilt() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("main.c", "x")?;
    space.run_expect(&mut stale_command(vec![]))?;

    std::fs::remove_file(space.path("main.exe"))?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "link main.exe");
    assert_output_not_contains(&out, "cc main.c");
    assert_output_contains(&out, "ran 1 tasks");
    Ok(())
}

#[cfg(unix)]
#[test]
fn command_that_skips_its_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(
        r#"{
        "commands": [
            {"description": "lazy", "kind": "command", "argv": ["true"], "outputs": ["never"]}
        ]
    }"#,
    )?;
    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "output never missing after command");
    Ok(())
}
