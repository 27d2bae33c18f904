use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use kernel::core::outcome::{OutcomeStatus, StepStatus};
use kernel::core::plan::Plan;
use kernel::io::config::{KernelConfig, VerificationCommands};
use kernel::io::sandbox::Sandbox;
use kernel::io::snapshot::CopySnapshotProvider;
use kernel::scheduler::{Scheduler, SchedulerConfig, Task};
use kernel::test_support::{CALC_FIX, repo_fixture};

fn fix_plan(diff: &str) -> Arc<Plan> {
    let json = serde_json::json!({
        "steps": [
            {"id": "read", "type": "read_file", "target_path": "src/calc.py"},
            {
                "id": "fix",
                "type": "apply_patch",
                "target_path": "src",
                "params": {"patch": "p1"},
                "depends_on": ["read"]
            },
            {"id": "test", "type": "run_tests", "depends_on": ["fix"]}
        ],
        "patches": {"p1": diff}
    });
    Arc::new(Plan::from_json(&json.to_string()).expect("plan"))
}

fn hostile_plan() -> Arc<Plan> {
    let json = serde_json::json!({
        "steps": [
            {"id": "test", "type": "run_tests", "params": {"selector": "tests; rm -rf /"}}
        ]
    });
    Arc::new(Plan::from_json(&json.to_string()).expect("plan"))
}

fn is_git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|output| output.status.success())
}

#[test]
fn repair_task_runs_in_isolated_snapshots() {
    if !is_git_available() {
        eprintln!("git not available, skipping");
        return;
    }
    let fixture = repo_fixture();
    let repo = fixture.repo.clone();
    let snapshots_dir = fixture.temp.path().join("snapshots");
    let audit_dir = fixture.temp.path().join("audit");

    let commands = VerificationCommands {
        run_tests: vec![
            "grep".to_string(),
            "-q".to_string(),
            "x = 2".to_string(),
            "src/calc.py".to_string(),
        ],
        ..VerificationCommands::default()
    };
    let cfg = KernelConfig {
        commands,
        ..KernelConfig::default()
    };
    let scheduler = Scheduler::new(
        Arc::new(Sandbox::from_config(&cfg)),
        Arc::new(CopySnapshotProvider::new(&snapshots_dir)),
        SchedulerConfig {
            audit_dir: Some(audit_dir.clone()),
            ..SchedulerConfig::from_config(&cfg)
        },
    );
    let task = Task {
        id: "calc".to_string(),
        repo: repo.clone(),
        context: BTreeMap::new(),
    };

    let variants = [
        fix_plan(&CALC_FIX.replace("+x = 2", "+x = 3")),
        fix_plan(CALC_FIX),
        hostile_plan(),
    ];
    let result = scheduler.run(&task, &variants, 3).expect("run");

    let statuses: Vec<_> = result.outcomes.iter().map(|o| o.status).collect();
    assert_eq!(
        statuses,
        vec![
            OutcomeStatus::FailTests,
            OutcomeStatus::Pass,
            OutcomeStatus::RejectedByGate
        ]
    );
    assert_eq!(result.winner.worker_id, 2);
    assert_eq!(result.outcomes[0].failing_test_count, 1);
    assert_eq!(
        result.winner.files_touched.iter().collect::<Vec<_>>(),
        vec!["src/calc.py"]
    );

    // Steps ran in plan order, one at a time.
    let steps = &result.winner.step_results;
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert!(steps.windows(2).all(|w| w[0].finished_at <= w[1].started_at));
    assert!(steps[0].stdout.contains("x = 1"));

    // Workers never touched the source repository and left no snapshot behind.
    assert_eq!(
        fs::read_to_string(repo.join("src").join("calc.py")).expect("read"),
        "x = 1\n"
    );
    let leftover = fs::read_dir(&snapshots_dir)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftover, 0);

    // Gate-rejected workers never open an audit log.
    assert!(audit_dir.join("worker-1.audit.jsonl").is_file());
    assert!(audit_dir.join("worker-2.audit.jsonl").is_file());
    assert!(!audit_dir.join("worker-3.audit.jsonl").exists());
}
