//! Agent loop behaviour: stage walking, cancellation branches, and the
//! no-autonomous-retry rule.

mod common;

use std::collections::HashMap;

use common::{Harness, BACKEND};
use rap_runner::executor::stub::StubBehaviour;
use rap_runner::models::{StatusCode, TaskKind};
use rap_runner::schema::TaskStage;

#[tokio::test]
async fn runjob_advances_one_stage_per_tick() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    let job = harness.job("extract_data");

    harness.agent_tick().await;
    assert_eq!(harness.stub.stage_of(&job.id), TaskStage::Prepared);
    assert_eq!(harness.job("extract_data").status_code, StatusCode::Prepared);

    harness.agent_tick().await;
    assert_eq!(harness.stub.stage_of(&job.id), TaskStage::Executing);
    assert_eq!(harness.job("extract_data").status_code, StatusCode::Executing);

    harness.stub.finish_execution(&job.id);
    harness.agent_tick().await;
    assert_eq!(harness.stub.stage_of(&job.id), TaskStage::Finalized);
    let final_job = harness.job("extract_data");
    assert_eq!(final_job.status_code, StatusCode::Succeeded);

    let calls = harness.stub.calls_for(&job.id);
    let ops: Vec<&str> = calls.iter().map(|c| c.as_str()).collect();
    assert_eq!(ops, vec!["prepare", "execute", "finalize", "cleanup"]);
}

#[tokio::test]
async fn agent_stops_reporting_after_agent_complete() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    harness.run_until_settled(30).await;

    let job = harness.job("extract_data");
    let calls_before = harness.stub.calls_for(&job.id).len();

    // Further ticks touch neither the executor nor the controller
    harness.agent_tick().await;
    harness.agent_tick().await;
    assert_eq!(harness.stub.calls_for(&job.id).len(), calls_before);
}

#[tokio::test]
async fn executor_error_is_reported_not_retried() {
    let mut harness = Harness::with_config(|config| {
        config.max_task_retries = 0;
    });
    harness.stub.set_behaviour(StubBehaviour {
        failing_prepare: HashMap::from([("extract_data".to_string(), true)]),
        ..Default::default()
    });
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    harness.agent_tick().await;

    let job = harness.job("extract_data");
    // With a zero retry budget the error is immediately terminal
    assert_eq!(job.status_code, StatusCode::JobError);

    // The agent called prepare exactly once: retry policy is the
    // controller's, never the agent's
    let prepares = harness
        .stub
        .calls_for(&job.id)
        .iter()
        .filter(|c| *c == "prepare")
        .count();
    assert_eq!(prepares, 1);
}

#[tokio::test]
async fn canceljob_for_untouched_job_cleans_up_and_confirms() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    // Dispatched, but the agent has not picked it up yet
    harness.controller_tick();
    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::Initiated);

    harness.set_cancelled("request-1", &["extract_data"]);
    harness.controller_tick();
    {
        let db = harness.db.lock().unwrap();
        let cancels = db.tasks_for_job(&job.id, TaskKind::CancelJob).unwrap();
        assert_eq!(cancels.len(), 1);
    }

    harness.agent_tick().await;

    // Nothing had happened yet, so no terminate or finalize: cleanup only,
    // and an immediate FINALIZED report
    let calls = harness.stub.calls_for(&job.id);
    assert!(!calls.contains(&"terminate".to_string()));
    assert!(!calls.contains(&"finalize".to_string()));
    assert!(calls.contains(&"cleanup".to_string()));

    let final_job = harness.jobs_for_request("request-1").pop().unwrap();
    assert_eq!(final_job.status_code, StatusCode::CancelledByUser);
}

#[tokio::test]
async fn dbstatus_probe_errors_do_not_set_the_flag() {
    let mut harness = Harness::new();
    // An unknown status makes the stub report it verbatim; the local
    // executor would reject it, here we script an empty (healthy) probe
    harness.stub.set_db_status("");
    harness.controller_tick();
    harness.agent_tick().await;

    assert_eq!(
        harness.flag(rap_runner::controller::tasks::DB_MAINTENANCE_FLAG),
        None
    );
    // Probe task completed
    let db = harness.db.lock().unwrap();
    assert!(db.active_tasks(BACKEND).unwrap().is_empty());
}
