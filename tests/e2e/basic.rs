use crate::e2e::*;

#[test]
fn not_configured() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "not configured");
    Ok(())
}

#[test]
fn main_c_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("main.c", "int main;")?;

    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "cc main.c");
    assert_output_contains(&out, "link main.exe");
    assert_output_contains(&out, "stale: ran 2 tasks, now up to date");
    assert_eq!(space.read("main.exe")?, "int main;");

    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_eq!(String::from_utf8_lossy(&out.stdout), "stale: no work to do\n");

    space.write("main.c", "int main2;")?;
    space.bump_mtime("main.c", 10)?;
    let out = space.run_expect(&mut stale_command(vec![]))?;
    assert_output_contains(&out, "stale: ran 2 tasks, now up to date");
    assert_eq!(space.read("main.exe")?, "int main2;");
    Ok(())
}

#[test]
fn process_workers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("main.c", "int main;")?;
    let out = space.run_expect(&mut stale_command(vec!["--workers", "process", "-j", "2"]))?;
    assert_output_contains(&out, "stale: ran 2 tasks, now up to date");
    assert_eq!(space.read("main.exe")?, "int main;");
    Ok(())
}

#[test]
fn show_modes_do_not_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    space.write("main.c", "int main;")?;

    let out = space.run_expect(&mut stale_command(vec!["--show-commands"]))?;
    assert_output_contains(&out, "cc main.c");
    assert_output_contains(&out, "link main.exe");

    let out = space.run_expect(&mut stale_command(vec!["--show-steps"]))?;
    assert_output_contains(&out, "step 1:\n  cc main.c\nstep 2:\n  link main.exe\n");

    let out = space.run_expect(&mut stale_command(vec!["--show-changed"]))?;
    assert_output_contains(&out, "main.c");

    let out = space.run_expect(&mut stale_command(vec!["--show-graph"]))?;
    assert_output_contains(&out, "out main.exe");
    assert_output_contains(&out, "  <- strong");

    assert!(space.read("main.o").is_err());
    Ok(())
}

#[test]
fn failed_task_output() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    // No main.c: the compile fails.
    let out = space.run(&mut stale_command(vec![]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "failed: cc main.c");
    assert_output_not_contains(&out, "link main.exe");
    assert_output_not_contains(&out, "now up to date");
    Ok(())
}

#[test]
fn conflicting_show_flags() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.configure(MAIN_C)?;
    let out = space.run(&mut stale_command(vec!["--show-graph", "--show-steps"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "only one --show-* flag");
    Ok(())
}
