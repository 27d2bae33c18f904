use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use kernel::exit_codes;

const FIX_PLAN: &str = r#"{
  "steps": [
    {"id": "fix", "type": "apply_patch", "target_path": "src", "params": {"patch": "p1"}},
    {"id": "test", "type": "run_tests", "depends_on": ["fix"]}
  ],
  "patches": {
    "p1": "--- a/src/calc.py\n+++ b/src/calc.py\n@@ -1 +1 @@\n-x = 1\n+x = 2\n"
  }
}"#;

const SHELL_PLAN: &str = r#"{"steps": [{"id": "s", "type": "run_shell", "params": {"cmd": "id"}}]}"#;

fn bench(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_bench"))
        .args(args)
        .current_dir(cwd)
        .env_remove("BENCH_STRICT")
        .env_remove("RUST_LOG")
        .output()
        .expect("spawn bench")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

/// Dataset with one task `calc` whose repo is `repos/calc`.
fn write_fixture(root: &Path) -> (PathBuf, PathBuf) {
    let repo = root.join("repos").join("calc");
    fs::create_dir_all(repo.join("src")).expect("mkdir");
    fs::write(repo.join("src").join("calc.py"), "x = 1\n").expect("write");
    let dataset = root.join("tasks.toml");
    fs::write(&dataset, "[[tasks]]\nid = \"calc\"\nrepo = \"repos/calc\"\n").expect("dataset");
    let plans = root.join("plans");
    fs::create_dir_all(plans.join("calc")).expect("mkdir");
    fs::write(
        root.join("bench.toml"),
        "[commands]\nrun_tests = [\"grep\", \"-q\", \"x = 2\", \"src/calc.py\"]\n",
    )
    .expect("config");
    (dataset, plans)
}

#[test]
fn strict_mode_fails_before_running_anything() {
    let temp = tempfile::tempdir().expect("tempdir");
    let out = temp.path().join("out");
    let output = bench(
        &[
            "run",
            "--dataset",
            "missing.toml",
            "--plans",
            "plans",
            "--strict",
            "--out",
            "out",
        ],
        temp.path(),
    );
    assert_eq!(output.status.code(), Some(exit_codes::STRICT_FATAL));
    assert!(String::from_utf8_lossy(&output.stderr).contains("strict mode"));
    assert!(!out.exists());
}

#[test]
fn strict_mode_can_come_from_the_environment() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (_, plans) = write_fixture(temp.path());
    fs::remove_dir_all(&plans).expect("remove plans");
    let output = Command::new(env!("CARGO_BIN_EXE_bench"))
        .args(["run", "--dataset", "tasks.toml", "--plans", "plans"])
        .current_dir(temp.path())
        .env("BENCH_STRICT", "yes")
        .output()
        .expect("spawn bench");
    assert_eq!(output.status.code(), Some(exit_codes::STRICT_FATAL));
}

#[test]
fn relaxed_mode_skips_tasks_without_plans() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_fixture(temp.path());
    let output = bench(
        &["run", "--dataset", "tasks.toml", "--plans", "plans", "--out", "out"],
        temp.path(),
    );
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    assert!(!temp.path().join("out").join("calc").exists());
}

#[test]
fn validate_prints_reports_and_sets_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("fix.json"), FIX_PLAN).expect("write");
    fs::write(temp.path().join("shell.json"), SHELL_PLAN).expect("write");

    let output = bench(&["validate", "fix.json"], temp.path());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let reports: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(reports["gate"]["accepted"], serde_json::Value::Bool(true));
    assert_eq!(reports["critique"]["result"], "ACCEPTED");

    let output = bench(&["validate", "shell.json"], temp.path());
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    let text = stdout(&output);
    assert!(text.contains("unknown_step_type"));
    assert!(text.contains("step_type_allowlisted"));
}

#[test]
fn run_records_results_and_report_aggregates_them() {
    if !git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let temp = tempfile::tempdir().expect("tempdir");
    let (_, plans) = write_fixture(temp.path());
    fs::write(plans.join("calc").join("a_fix.json"), FIX_PLAN).expect("write");
    fs::write(plans.join("calc").join("b_shell.json"), SHELL_PLAN).expect("write");

    let output = bench(
        &[
            "run",
            "--dataset",
            "tasks.toml",
            "--plans",
            "plans",
            "--config",
            "bench.toml",
            "--out",
            "out",
        ],
        temp.path(),
    );
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout(&output).contains("winner=worker-1 status=PASS"));

    let task_dir = temp.path().join("out").join("calc");
    let runs: Vec<_> = fs::read_dir(&task_dir)
        .expect("runs")
        .map(|entry| entry.expect("entry").path())
        .collect();
    assert_eq!(runs.len(), 1);
    let run_dir = &runs[0];
    assert!(run_dir.join("result.json").is_file());
    assert!(run_dir.join("meta.json").is_file());
    assert!(run_dir.join("worker-1.audit.jsonl").is_file());

    let meta: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run_dir.join("meta.json")).expect("meta"))
            .expect("json");
    assert_eq!(meta["winner_status"], "PASS");
    assert_eq!(meta["worker_count"], 2);

    // The source repository is untouched and no snapshot survives.
    assert_eq!(
        fs::read_to_string(temp.path().join("repos/calc/src/calc.py")).expect("read"),
        "x = 1\n"
    );
    let snapshots = temp.path().join("out").join(".snapshots");
    assert_eq!(fs::read_dir(&snapshots).map(Iterator::count).unwrap_or(0), 0);

    let output = bench(&["report", "--out", "out"], temp.path());
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let text = stdout(&output);
    assert!(text.contains("report: runs=1 workers=2 gate_rejections=1"));
    assert!(text.contains("report: winner PASS 1"));
    assert!(text.contains("report: passed=1 failed=0 pass_rate=1.00"));
}

#[test]
fn task_filters_pick_tasks_in_dataset_order() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (dataset, plans) = write_fixture(temp.path());
    let mut entries = String::new();
    for id in ["calc", "calc-b", "calc-c"] {
        entries.push_str(&format!("[[tasks]]\nid = \"{id}\"\nrepo = \"repos/calc\"\n\n"));
        fs::create_dir_all(plans.join(id)).expect("mkdir");
        fs::write(
            plans.join(id).join("read.json"),
            r#"{"steps": [{"id": "r", "type": "read_file", "target_path": "src/calc.py"}]}"#,
        )
        .expect("write");
    }
    fs::write(&dataset, entries).expect("dataset");

    let output = bench(
        &[
            "run", "--dataset", "tasks.toml", "--plans", "plans", "--task-id", "calc-c",
            "--task-id", "calc-b", "--max-tasks", "1", "--out", "out",
        ],
        temp.path(),
    );
    assert_eq!(
        output.status.code(),
        Some(exit_codes::OK),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let text = stdout(&output);
    assert!(text.contains("run: task=calc-b "));
    assert_eq!(text.matches("run: task=").count(), 1);
    let out = temp.path().join("out");
    assert!(out.join("calc-b").is_dir());
    assert!(!out.join("calc").exists());
    assert!(!out.join("calc-c").exists());

    let output = bench(&["report", "--out", "out"], temp.path());
    assert!(stdout(&output).contains("report: passed=1 failed=0 pass_rate=1.00"));

    let output = bench(
        &["run", "--dataset", "tasks.toml", "--plans", "plans", "--task-id", "nope"],
        temp.path(),
    );
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown task id nope"));
}

#[cfg(unix)]
#[test]
fn symlink_escape_exits_with_security_violation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let (_, plans) = write_fixture(temp.path());
    let outside = temp.path().join("outside");
    fs::create_dir_all(&outside).expect("mkdir");
    fs::write(outside.join("notes.txt"), "private\n").expect("write");
    std::os::unix::fs::symlink(&outside, temp.path().join("repos/calc/escape")).expect("symlink");
    fs::write(
        plans.join("calc").join("read.json"),
        r#"{"steps": [{"id": "r", "type": "read_file", "target_path": "escape/notes.txt"}]}"#,
    )
    .expect("write");

    let output = bench(
        &["run", "--dataset", "tasks.toml", "--plans", "plans", "--out", "out"],
        temp.path(),
    );
    assert_eq!(output.status.code(), Some(exit_codes::SECURITY_VIOLATION));
    assert!(stdout(&output).contains("status=SECURITY_VIOLATION"));

    let output = bench(&["report", "--out", "out"], temp.path());
    assert!(stdout(&output).contains("report: security_violation task=calc"));
}
