//! Independent tasks share one model client; the limiter bounds how many
//! model calls overlap across all of them.

use std::sync::Arc;
use std::time::Duration;

use coder::core::plan::Plan;
use coder::core::step::Step;
use coder::core::types::TaskStatus;
use coder::io::model::LimitedModel;
use coder::orchestrator::{Orchestrator, TaskRequest};
use coder::test_support::{Harness, ScriptedModel};

fn plan_for(path: &str) -> Plan {
    Plan::new(
        "write one file",
        vec![Step::generate("write it", path, "a constant")],
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_respect_the_model_call_limit() {
    let model = ScriptedModel::with_delay(Duration::from_millis(20));
    // Only the planning calls are scripted; the code and refinement calls that
    // follow fail fast but still hold a permit while they wait.
    for path in ["a.py", "b.py", "c.py", "d.py"] {
        model.push_plan(&plan_for(path));
    }
    let harness = Harness::with_model(model);
    let limited = Arc::new(LimitedModel::new(harness.model.clone(), 2));
    let mut services = harness.services();
    services.model = limited.clone();

    let orchestrator = Arc::new(
        Orchestrator::start(services, &harness.config)
            .await
            .expect("orchestrator"),
    );
    let tasks: Vec<_> = ["alpha", "beta", "gamma", "delta"]
        .into_iter()
        .map(|name| {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                orchestrator
                    .run(TaskRequest::new(&format!("plan {name}")).with_task_id(name))
                    .await
            })
        })
        .collect();

    for task in tasks {
        let outcome = task.await.expect("join").expect("run");
        assert!(matches!(
            outcome.status,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        ));
    }

    assert!(harness.model.max_in_flight() <= 2);
    assert!(harness.model.max_in_flight() >= 1);
    assert_eq!(limited.available_permits(), 2);
}

#[tokio::test]
async fn each_task_keeps_its_own_state() {
    let harness = Harness::new();
    harness
        .model
        .push_plan(&Plan::new("one", vec![Step::run_command("one", "echo one")]));
    harness
        .model
        .push_plan(&Plan::new("two", vec![Step::run_command("two", "echo two")]));
    let orchestrator = harness.orchestrator().await;

    let (first, second) = tokio::join!(
        orchestrator.run(TaskRequest::new("first").with_task_id("first")),
        orchestrator.run(TaskRequest::new("second").with_task_id("second")),
    );
    let first = first.expect("first");
    let second = second.expect("second");

    assert_eq!(first.status, TaskStatus::Succeeded);
    assert_eq!(second.status, TaskStatus::Succeeded);
    let states = harness.states();
    assert_eq!(
        states.list_task_ids().await,
        vec!["first".to_string(), "second".to_string()]
    );
    for id in ["first", "second"] {
        let state = states.load(id).await.expect("state");
        assert_eq!(state.step_results.len(), 1);
        assert_eq!(state.status, TaskStatus::Succeeded);
    }
}
