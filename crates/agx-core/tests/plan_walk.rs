//! Plan walks against scripted tools and the real sandbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agx_core::{
    ExecutionPlan, FailureClass, Params, ParameterSchema, PlanOutcome, PlanWalker,
    RecoveryStrategy, SandboxConfig, StepId, StepStatus, TaskPlanner, Tool, ToolRegistry,
    ToolResult, WalkConfig,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// Returns a fixed result and records every parameter set it receives.
struct Scripted {
    name: &'static str,
    result: ToolResult,
    seen: Arc<Mutex<Vec<Params>>>,
}

impl Scripted {
    fn new(name: &'static str, result: ToolResult) -> (Self, Arc<Mutex<Vec<Params>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                name,
                result,
                seen: seen.clone(),
            },
            seen,
        )
    }
}

#[async_trait]
impl Tool for Scripted {
    fn name(&self) -> &str {
        self.name
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        self.seen.lock().unwrap().push(params.clone());
        self.result.clone()
    }
}

/// Sleeps, tracking the peak number of concurrent calls.
struct Slow {
    delay: Duration,
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
    }

    async fn invoke(&self, _params: &Params) -> ToolResult {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        ToolResult::ok(json!("done"))
    }
}

fn ctx(v: Value) -> Params {
    serde_json::from_value(v).unwrap()
}

fn walker(registry: ToolRegistry, config: WalkConfig) -> PlanWalker {
    PlanWalker::new(Arc::new(registry), SandboxConfig::default(), config)
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// -------------------------------------------------------------------------
// Tool steps
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_refactor_chain_feeds_each_step_the_previous_output() {
    let mut registry = ToolRegistry::new();
    let (search, _) = Scripted::new(
        "search",
        ToolResult::ok(json!({"matches": [{"path": "lib.py", "line": 1}]})),
    );
    let (read, read_seen) = Scripted::new(
        "file_read",
        ToolResult::ok(json!({"path": "lib.py", "content": "def a(): pass"})),
    );
    let (write, write_seen) = Scripted::new("file_write", ToolResult::ok(json!({"size": 13})));
    registry.register(search).unwrap();
    registry.register(read).unwrap();
    registry.register(write).unwrap();

    let plan = TaskPlanner::new()
        .plan(
            "rename a to b",
            &ctx(json!({"old_name": "a", "new_name": "b"})),
            &registry.names(),
        )
        .unwrap();
    let (plan, report) = walker(registry, WalkConfig::default())
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Completed);
    assert!(report.replans.is_empty());
    assert!(plan
        .steps()
        .iter()
        .all(|s| s.status() == StepStatus::Completed));

    let read_params = &read_seen.lock().unwrap()[0];
    assert_eq!(read_params["input"]["matches"][0]["path"], json!("lib.py"));
    let write_params = &write_seen.lock().unwrap()[0];
    assert_eq!(write_params["input"]["content"], json!("def a(): pass"));
    assert_eq!(write_params["new_name"], json!("b"));
}

#[tokio::test]
async fn test_missing_file_walk_recovers_through_search() {
    let mut registry = ToolRegistry::new();
    let (read, _) = Scripted::new(
        "file_read",
        ToolResult::err("cannot open config/app.toml").with_failure_class(FailureClass::NotFound),
    );
    let (search, search_seen) = Scripted::new(
        "search",
        ToolResult::ok(json!({"files": ["etc/app.toml"]})),
    );
    registry.register(read).unwrap();
    registry.register(search).unwrap();

    let plan = TaskPlanner::new()
        .plan(
            "read config",
            &ctx(json!({"path": "config/app.toml"})),
            &registry.names(),
        )
        .unwrap();
    let (plan, report) = walker(registry, WalkConfig::default())
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Completed);
    assert_eq!(report.replans.len(), 1);
    let replan = &report.replans[0];
    assert_eq!(replan.failed, StepId::nth(1));
    assert_eq!(replan.reason.class, FailureClass::NotFound);

    let recovery = plan.step(&replan.recovery).unwrap();
    assert_eq!(recovery.recovery().unwrap().strategy, RecoveryStrategy::Search);
    assert_eq!(search_seen.lock().unwrap()[0]["pattern"], json!("app.toml"));
}

#[tokio::test]
async fn test_replanning_can_be_disabled() {
    let mut registry = ToolRegistry::new();
    let (read, _) = Scripted::new("file_read", ToolResult::err("File not found: x"));
    registry.register(read).unwrap();

    let plan = TaskPlanner::new()
        .plan("read x", &ctx(json!({"path": "x"})), &registry.names())
        .unwrap();
    let config = WalkConfig {
        replan: false,
        ..WalkConfig::default()
    };
    let (plan, report) = walker(registry, config)
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(plan.len(), 1);
    assert!(report.replans.is_empty());
    assert_eq!(
        report.outcome,
        PlanOutcome::Incomplete {
            failed: vec![StepId::nth(1)],
            blocked: vec![],
        }
    );
}

#[tokio::test]
async fn test_independent_steps_respect_concurrency_cap() {
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry
        .register(Slow {
            delay: Duration::from_millis(100),
            current: current.clone(),
            peak: peak.clone(),
        })
        .unwrap();

    let mut plan = ExecutionPlan::new("fan out", Params::new()).with_available_tools(&["slow"]);
    for i in 0..5 {
        plan.add_step("slow", Params::new(), format!("slow {i}"), vec![])
            .unwrap();
    }
    let config = WalkConfig {
        max_concurrent: 2,
        ..WalkConfig::default()
    };
    let (_, report) = walker(registry, config)
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Completed);
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(current.load(Ordering::SeqCst), 0);
}

// -------------------------------------------------------------------------
// Cancellation
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_cancellation_reports_interrupted_and_pending_steps() {
    let mut registry = ToolRegistry::new();
    registry
        .register(Slow {
            delay: Duration::from_secs(30),
            current: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        })
        .unwrap();

    let mut plan = ExecutionPlan::new("long", Params::new()).with_available_tools(&["slow"]);
    let first = plan.add_step("slow", Params::new(), "first", vec![]).unwrap();
    let second = plan
        .add_step("slow", Params::new(), "second", vec![first.clone()])
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let (plan, report) = tokio::time::timeout(
        Duration::from_secs(10),
        walker(registry, WalkConfig::default()).run(plan, cancel),
    )
    .await
    .expect("walk should stop promptly after cancellation")
    .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::Cancelled {
            interrupted: vec![first.clone()],
            pending: vec![second.clone()],
        }
    );
    assert_eq!(plan.step(&first).unwrap().status(), StepStatus::Running);
    assert_eq!(plan.step(&second).unwrap().status(), StepStatus::Pending);
}

// -------------------------------------------------------------------------
// Sandboxed code steps
// -------------------------------------------------------------------------

#[tokio::test]
async fn test_code_steps_run_in_the_sandbox() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let plan = TaskPlanner::new()
        .plan(
            "run python script",
            &ctx(json!({"code": "print(6 * 7)"})),
            &["run_code"],
        )
        .unwrap();
    let (plan, report) = walker(ToolRegistry::new(), WalkConfig::default())
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.outcome, PlanOutcome::Completed);
    let result = plan.step(&StepId::nth(1)).unwrap().result().unwrap();
    assert_eq!(result["stdout"], json!("42\n"));
    assert_eq!(result["terminationReason"], json!("normal"));
}

#[tokio::test]
async fn test_failing_code_step_ends_with_a_diagnostic() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let plan = TaskPlanner::new()
        .plan(
            "execute code",
            &ctx(json!({"code": "raise ValueError('bad input')"})),
            &["run_code"],
        )
        .unwrap();
    let (plan, report) = walker(ToolRegistry::new(), WalkConfig::default())
        .run(plan, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.replans.len(), 1);
    let diag = plan.step(&report.replans[0].recovery).unwrap();
    assert_eq!(diag.tool(), "diagnostic");
    assert_eq!(diag.status(), StepStatus::Completed);
    assert!(report.replans[0].reason.message.contains("ValueError"));
    assert_eq!(
        report.outcome,
        PlanOutcome::Incomplete {
            failed: vec![StepId::nth(1)],
            blocked: vec![],
        }
    );
}

#[tokio::test]
async fn test_cancelling_a_code_step_kills_it_and_removes_its_workdir() {
    if !python_available() {
        eprintln!("python3 not found, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let plan = TaskPlanner::new()
        .plan(
            "run python script",
            &ctx(json!({"code": "while True:\n    pass\n"})),
            &["run_code"],
        )
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        trigger.cancel();
    });

    let walker = PlanWalker::new(
        Arc::new(ToolRegistry::new()),
        SandboxConfig::default().with_work_root(root.path()),
        WalkConfig::default(),
    );
    let (plan, report) = tokio::time::timeout(Duration::from_secs(10), walker.run(plan, cancel))
        .await
        .expect("walk should stop promptly after cancellation")
        .unwrap();

    assert_eq!(
        report.outcome,
        PlanOutcome::Cancelled {
            interrupted: vec![StepId::nth(1)],
            pending: vec![],
        }
    );
    assert_eq!(plan.step(&StepId::nth(1)).unwrap().status(), StepStatus::Running);
    let leftovers: Vec<_> = std::fs::read_dir(root.path()).unwrap().collect();
    assert!(leftovers.is_empty(), "sandbox left files behind: {leftovers:?}");
}
