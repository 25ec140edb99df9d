//! Integration tests for the `scribe` binary.
//!
//! Each test runs the built binary with `XDG_CONFIG_HOME` pointed at a
//! temporary directory, so no real config file is read or written. The
//! end-to-end tests use a small shell script as the generator command.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

const COHERENT_DOC: &str = "\
# Quarterly Report

## Revenue
Revenue across every region grew during the quarter. Customer demand in
each region stayed strong and revenue per customer rose.

## Regions
Regional revenue figures show the strongest customer growth in the
northern region. Every region reported revenue above plan.
";

fn scribe(config_home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_scribe"));
    cmd.env("XDG_CONFIG_HOME", config_home)
        .env("RUST_LOG", "warn")
        .env_remove("SCRIBE_CONTEXT_CEILING")
        .env_remove("SCRIBE_GENERATOR_CMD")
        .env_remove("SCRIBE_SNAPSHOT_DIR");
    cmd
}

fn run(cmd: &mut Command) -> Output {
    cmd.output().expect("failed to run scribe binary")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// A generator that ignores its prompt and always answers with the same
/// three-section outline.
#[cfg(unix)]
fn outline_script(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-model.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         cat > /dev/null\n\
         printf '# Field Notes\\n\\n## Arrival\\n- the harbour at dawn\\n\\n\
         ## Market\\n- fish and bread\\n\\n## Departure\\n- the evening ferry\\n'\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[test]
fn init_writes_config_and_refuses_to_overwrite() {
    let tmp = TempDir::new().unwrap();

    let first = run(scribe(tmp.path()).arg("init"));
    assert!(first.status.success(), "init failed: {}", stderr(&first));
    let path = tmp.path().join("scribe").join("config.toml");
    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.contains("[pipeline.budget]"), "config: {contents}");
    assert!(contents.contains("[generator]"));

    let second = run(scribe(tmp.path()).arg("init"));
    assert!(!second.status.success());
    assert!(stderr(&second).contains("--force"));

    let forced = run(scribe(tmp.path()).args(["init", "--force"]));
    assert!(forced.status.success());
}

#[test]
fn templates_lists_builtins() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path()).arg("templates"));
    assert!(output.status.success());
    let out = stdout(&output);
    for id in ["report", "article", "tutorial", "essay"] {
        assert!(out.contains(id), "missing {id}: {out}");
    }
}

#[test]
fn check_reports_sections_as_json() {
    let tmp = TempDir::new().unwrap();
    let doc = tmp.path().join("doc.md");
    std::fs::write(&doc, COHERENT_DOC).unwrap();

    let output = run(scribe(tmp.path()).arg("check").arg(&doc).arg("--json"));
    assert!(output.status.success(), "check failed: {}", stderr(&output));
    let report: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(report["sections_checked"], 2);
    let score = report["score"].as_f64().unwrap();
    assert!((0.0..=1.0).contains(&score));
}

#[test]
fn check_missing_file_fails() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path()).args(["check", "/nonexistent/doc.md"]));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("failed to read"));
}

#[test]
fn status_requires_snapshot_dir() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path()).arg("status"));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no snapshot directory configured"));
}

#[test]
fn status_with_empty_snapshot_dir() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path())
        .arg("status")
        .arg("--snapshot-dir")
        .arg(tmp.path().join("snapshots")));
    assert!(output.status.success(), "status failed: {}", stderr(&output));
    assert!(stdout(&output).contains("No sessions found."));
}

#[test]
fn invalid_ceiling_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path())
        .env("SCRIBE_CONTEXT_CEILING", "100")
        .args(["plan", "anything"]));
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid pipeline configuration"));
}

#[test]
fn completions_generate_for_bash() {
    let tmp = TempDir::new().unwrap();
    let output = run(scribe(tmp.path()).args(["completions", "bash"]));
    assert!(output.status.success());
    assert!(stdout(&output).contains("scribe"));
}

#[cfg(unix)]
#[test]
fn plan_prints_outline_from_generator_command() {
    let tmp = TempDir::new().unwrap();
    let script = outline_script(tmp.path());

    let output = run(scribe(tmp.path())
        .arg("--generator-cmd")
        .arg(&script)
        .args(["plan", "Notes from a day trip to the coast"]));
    assert!(output.status.success(), "plan failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("# Field Notes"), "outline: {out}");
    assert!(out.contains("## Market"));
}

#[cfg(unix)]
#[test]
fn generate_writes_document_and_snapshot() {
    let tmp = TempDir::new().unwrap();
    let script = outline_script(tmp.path());
    let snapshots = tmp.path().join("snapshots");
    let document = tmp.path().join("trip.md");

    let output = run(scribe(tmp.path())
        .arg("--generator-cmd")
        .arg(&script)
        .arg("--snapshot-dir")
        .arg(&snapshots)
        .args(["generate", "Notes from a day trip to the coast", "-o"])
        .arg(&document));
    assert!(output.status.success(), "generate failed: {}", stderr(&output));
    assert!(stdout(&output).contains("## Arrival"));
    let text = std::fs::read_to_string(&document).unwrap();
    assert!(text.starts_with("## Arrival"), "document: {text}");
    assert!(text.contains("## Departure"));

    let status = run(scribe(tmp.path()).arg("status").arg("--snapshot-dir").arg(&snapshots));
    assert!(status.status.success());
    let listing = stdout(&status);
    assert!(listing.contains("completed"), "status: {listing}");
    assert!(listing.contains("3/3"));
}
