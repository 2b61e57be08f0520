//! End-to-end scenarios: controller and agent ticking against the stub
//! executor, from job request to reported terminal state.

mod common;

use std::collections::HashMap;

use common::{Harness, BACKEND};
use rap_runner::agent::AgentLoop;
use rap_runner::controller::tasks::DB_MAINTENANCE_FLAG;
use rap_runner::executor::stub::StubBehaviour;
use rap_runner::models::{State, StatusCode, TaskKind};
use rap_runner::schema::JobTaskResults;
use rap_runner::testing::{agent_config, InProcessClient};

#[tokio::test]
async fn simple_success_runs_dependency_then_dependent() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(40).await;

    let extract = harness.job("extract_data");
    let model = harness.job("run_model");
    assert_eq!(extract.state, State::Succeeded);
    assert_eq!(model.state, State::Succeeded);
    assert!(
        extract.completed_at.unwrap() <= model.started_at.unwrap_or(i64::MAX),
        "dependency finished before dependent started"
    );

    // The status pushed to the job-server carries output counts
    let db = harness.db.lock().unwrap();
    let results = db
        .tasks_for_job(&extract.id, TaskKind::RunJob)
        .unwrap()
        .pop()
        .and_then(|t| t.agent_results)
        .and_then(|v| JobTaskResults::from_value(&v))
        .expect("results recorded");
    assert_eq!(results.output_count, 1);
    assert_eq!(results.exit_code, Some(0));
}

#[tokio::test]
async fn dependency_failure_blocks_dependent_without_dispatch() {
    let mut harness = Harness::new();
    harness.stub.set_behaviour(StubBehaviour {
        exit_codes: HashMap::from([("extract_data".to_string(), 2)]),
        ..Default::default()
    });
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(40).await;

    let extract = harness.job("extract_data");
    let model = harness.job("run_model");
    assert_eq!(extract.status_code, StatusCode::NonzeroExit);
    assert_eq!(extract.state, State::Failed);
    assert_eq!(model.status_code, StatusCode::DependencyFailed);
    assert_eq!(model.state, State::Failed);

    // No RUNJOB task was ever created for the dependent
    let db = harness.db.lock().unwrap();
    assert!(db
        .tasks_for_job(&model.id, TaskKind::RunJob)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn cancellation_mid_run_terminates_and_confirms() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);

    // Drive to EXECUTING
    harness.controller_tick();
    harness.agent_tick().await; // prepare
    harness.agent_tick().await; // execute
    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::Executing);

    // User cancels the action
    harness.set_cancelled("request-1", &["extract_data"]);
    harness.controller_tick();

    {
        let db = harness.db.lock().unwrap();
        let runjobs = db.tasks_for_job(&job.id, TaskKind::RunJob).unwrap();
        assert!(!runjobs[0].active, "RUNJOB deactivated");
        let cancels = db.tasks_for_job(&job.id, TaskKind::CancelJob).unwrap();
        assert_eq!(cancels.len(), 1);
        assert!(cancels[0].active);
    }

    // Agent reacts on its next poll: terminate, finalize(cancelled), cleanup
    harness.agent_tick().await;
    let calls = harness.stub.calls_for(&job.id);
    assert!(calls.contains(&"terminate".to_string()));
    assert!(calls.contains(&"finalize".to_string()));
    assert!(calls.contains(&"cleanup".to_string()));

    harness.controller_tick();
    let cancelled = harness.jobs_for_request("request-1").pop().unwrap();
    assert_eq!(cancelled.status_code, StatusCode::CancelledByUser);
    assert_eq!(cancelled.state, State::Failed);

    // Nothing is left active for the agent
    let db = harness.db.lock().unwrap();
    assert!(db
        .active_tasks(BACKEND)
        .unwrap()
        .iter()
        .all(|t| t.kind == TaskKind::DbStatus));
}

#[tokio::test]
async fn pending_cancellation_never_dispatches() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();

    // run_model is still waiting on its dependency; cancel it
    harness.set_cancelled("request-1", &["run_model"]);
    harness.controller_tick();

    let model = harness.jobs_for_request("request-1")
        .into_iter()
        .find(|j| j.action == "run_model")
        .unwrap();
    assert_eq!(model.status_code, StatusCode::CancelledByUser);
    let db = harness.db.lock().unwrap();
    assert!(db
        .tasks_for_job(&model.id, TaskKind::RunJob)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn worker_cap_is_never_exceeded() {
    const THREE: &str = r#"
actions:
  job_a:
    run: python:latest analysis/a.py
    outputs:
      moderately_sensitive:
        out: output/a.csv
  job_b:
    run: python:latest analysis/b.py
    outputs:
      moderately_sensitive:
        out: output/b.csv
  job_c:
    run: python:latest analysis/c.py
    outputs:
      moderately_sensitive:
        out: output/c.csv
"#;
    let mut harness = Harness::build(THREE, |config| {
        config.max_workers.insert(BACKEND.to_string(), 2);
    });
    harness.submit_actions("request-1", &["job_a"]);
    harness.submit_actions("request-2", &["job_b"]);
    harness.submit_actions("request-3", &["job_c"]);

    // Drive everything to completion, checking the cap at every step
    for _ in 0..40 {
        harness.controller_tick();
        harness.agent_tick().await;
        let jobs = harness.jobs();
        let executing = jobs
            .iter()
            .filter(|j| j.status_code == StatusCode::Executing)
            .count();
        let running = jobs.iter().filter(|j| j.state == State::Running).count();
        assert!(executing <= 2, "EXECUTING count exceeded the cap");
        assert!(running <= 2, "RUNNING count exceeded the cap");
        for job in &jobs {
            harness.stub.finish_execution(&job.id);
        }
        if !jobs.is_empty() && jobs.iter().all(|j| j.state.is_terminal()) {
            break;
        }
    }
    harness.assert_all_terminal();
}

#[tokio::test]
async fn db_maintenance_winds_down_db_jobs_only() {
    const MIXED: &str = r#"
actions:
  extract:
    run: ehrql:v1 generate-dataset analysis/dataset.py
    outputs:
      highly_sensitive:
        dataset: output/dataset.csv
  crunch:
    run: python:latest analysis/crunch.py
    outputs:
      moderately_sensitive:
        out: output/crunch.csv
"#;
    let mut harness = Harness::with_project(MIXED);
    harness.submit_actions("request-1", &["extract"]);
    harness.submit_actions("request-2", &["crunch"]);

    // Both jobs to EXECUTING; complete the DBSTATUS probe while we are at it
    harness.stub.set_db_status("");
    harness.controller_tick();
    harness.agent_tick().await;
    harness.agent_tick().await;
    assert_eq!(harness.job("extract").status_code, StatusCode::Executing);
    assert_eq!(harness.job("crunch").status_code, StatusCode::Executing);

    // Maintenance begins
    harness.set_flag(DB_MAINTENANCE_FLAG, Some("db-maintenance"));
    harness.controller_tick();

    let extract = harness.job("extract");
    assert_eq!(extract.status_code, StatusCode::WaitingDbMaintenance);
    assert_eq!(extract.state, State::Pending);
    {
        let db = harness.db.lock().unwrap();
        let runjobs = db.tasks_for_job(&extract.id, TaskKind::RunJob).unwrap();
        assert!(!runjobs[0].active, "db job's RUNJOB deactivated");
        let cancels = db.tasks_for_job(&extract.id, TaskKind::CancelJob).unwrap();
        assert_eq!(cancels.len(), 1);
    }
    // The non-db job is untouched
    assert_eq!(harness.job("crunch").status_code, StatusCode::Executing);

    // Agent winds the container down
    harness.agent_tick().await;
    assert!(harness
        .stub
        .calls_for(&extract.id)
        .contains(&"terminate".to_string()));

    // Maintenance ends; the job is re-issued as a fresh task and succeeds
    harness.set_flag(DB_MAINTENANCE_FLAG, None);
    harness.run_until_settled(40).await;

    let extract = harness.job("extract");
    assert_eq!(extract.status_code, StatusCode::Succeeded);
    let db = harness.db.lock().unwrap();
    let runjobs = db.tasks_for_job(&extract.id, TaskKind::RunJob).unwrap();
    assert_eq!(runjobs.len(), 2, "fresh RUNJOB after maintenance");
}

#[tokio::test]
async fn dbstatus_probe_sets_and_clears_maintenance_flag() {
    let mut harness = Harness::new();
    harness.stub.set_db_status("db-maintenance");
    harness.controller_tick(); // issues the probe
    harness.agent_tick().await; // runs it
    assert_eq!(
        harness.flag(DB_MAINTENANCE_FLAG).as_deref(),
        Some("db-maintenance")
    );
}

#[tokio::test]
async fn agent_restart_resumes_without_duplicating_work() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    harness.agent_tick().await; // prepare
    harness.agent_tick().await; // execute
    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::Executing);
    let prepares_before = harness
        .stub
        .calls_for(&job.id)
        .iter()
        .filter(|c| *c == "prepare")
        .count();

    // "Restart": a brand new agent loop over the same executor state
    let tmp = tempfile::tempdir().unwrap();
    let client = InProcessClient {
        db: harness.db.clone(),
        config: harness.config.clone(),
        backend: BACKEND.to_string(),
    };
    let mut restarted = AgentLoop::new(
        harness.stub.clone(),
        client,
        agent_config(BACKEND, tmp.path()),
    );
    restarted.tick().await.unwrap();

    // Still executing, no second prepare, no state change on the controller
    let after = harness.job("extract_data");
    assert_eq!(after.status_code, StatusCode::Executing);
    let prepares_after = harness
        .stub
        .calls_for(&job.id)
        .iter()
        .filter(|c| *c == "prepare")
        .count();
    assert_eq!(prepares_before, prepares_after);

    // The restarted agent carries the job to completion
    harness.stub.finish_execution(&job.id);
    restarted.tick().await.unwrap();
    harness.controller_tick();
    assert_eq!(harness.job("extract_data").state, State::Succeeded);
}

#[tokio::test]
async fn unmatched_patterns_fail_with_specific_code() {
    let mut harness = Harness::new();
    harness.stub.set_behaviour(StubBehaviour {
        unmatched_patterns: vec!["extract_data".to_string()],
        ..Default::default()
    });
    harness.submit_actions("request-1", &["extract_data"]);
    harness.run_until_settled(40).await;

    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::UnmatchedPatterns);
    assert_eq!(job.state, State::Failed);
}
