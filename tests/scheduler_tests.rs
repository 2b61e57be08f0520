//! Tests for the controller state machine: admission, dependencies,
//! retries, pause and terminal-state discipline.

mod common;

use common::{Harness, BACKEND};
use rap_runner::models::{State, StatusCode, TaskKind};
use rap_runner::schema::{TaskStage, TaskUpdate};
use std::collections::HashMap;

const THREE_INDEPENDENT: &str = r#"
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

#[tokio::test]
async fn dependencies_gate_admission() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();
    harness.controller_tick();

    let extract = harness.job("extract_data");
    let model = harness.job("run_model");
    assert_eq!(extract.state, State::Running);
    assert_eq!(extract.status_code, StatusCode::Initiated);
    assert_eq!(model.state, State::Pending);
    assert_eq!(model.status_code, StatusCode::WaitingOnDependencies);

    // The dependent never gets a task while its dependency is unfinished
    let db = harness.db.lock().unwrap();
    assert!(db
        .tasks_for_job(&model.id, TaskKind::RunJob)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn worker_cap_holds_jobs_in_waiting_on_workers() {
    let mut harness = Harness::build(THREE_INDEPENDENT, |config| {
        config.max_workers.insert(BACKEND.to_string(), 2);
    });
    harness.submit_actions("request-1", &["job_a"]);
    harness.submit_actions("request-2", &["job_b"]);
    harness.submit_actions("request-3", &["job_c"]);
    harness.controller_tick();
    harness.controller_tick();

    let running: Vec<_> = harness
        .jobs()
        .into_iter()
        .filter(|j| j.state == State::Running)
        .collect();
    let waiting: Vec<_> = harness
        .jobs()
        .into_iter()
        .filter(|j| j.status_code == StatusCode::WaitingOnWorkers)
        .collect();
    assert_eq!(running.len(), 2);
    assert_eq!(waiting.len(), 1);

    // Drive the two running jobs to completion; the third is admitted
    harness.agent_tick().await;
    harness.agent_tick().await;
    for job in harness.jobs() {
        harness.stub.finish_execution(&job.id);
    }
    harness.run_until_settled(30).await;
    harness.assert_all_terminal();
    for job in harness.jobs() {
        assert_eq!(job.status_code, StatusCode::Succeeded);
    }
}

#[tokio::test]
async fn db_worker_cap_is_independent_of_total_cap() {
    const TWO_DB: &str = r#"
actions:
  db_one:
    run: ehrql:v1 generate-dataset one.py
    outputs:
      highly_sensitive:
        out: output/one.csv
  db_two:
    run: ehrql:v1 generate-dataset two.py
    outputs:
      highly_sensitive:
        out: output/two.csv
"#;
    let mut harness = Harness::build(TWO_DB, |config| {
        config.max_db_workers.insert(BACKEND.to_string(), 1);
    });
    harness.submit_actions("request-1", &["db_one"]);
    harness.submit_actions("request-2", &["db_two"]);
    harness.controller_tick();
    harness.controller_tick();

    let codes: Vec<StatusCode> = harness.jobs().iter().map(|j| j.status_code).collect();
    assert!(codes.contains(&StatusCode::Initiated));
    assert!(codes.contains(&StatusCode::WaitingOnDbWorkers));
}

#[tokio::test]
async fn fifo_admission_among_ready_jobs() {
    let mut harness = Harness::build(THREE_INDEPENDENT, |config| {
        config.max_workers.insert(BACKEND.to_string(), 1);
    });
    // Submit in a known order; the earlier submission is admitted first
    harness.submit_actions("request-1", &["job_a"]);
    harness.controller_tick();
    harness.submit_actions("request-2", &["job_b"]);
    harness.controller_tick();

    let a = harness.job("job_a");
    let b = harness.job("job_b");
    assert_eq!(a.state, State::Running, "first submitted runs first");
    assert_eq!(b.status_code, StatusCode::WaitingOnWorkers);
}

#[tokio::test]
async fn paused_backend_holds_pending_jobs() {
    let mut harness = Harness::new();
    harness.set_flag("paused", Some("true"));
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();

    let job = harness.job("extract_data");
    assert_eq!(job.state, State::Pending);
    assert_eq!(job.status_code, StatusCode::WaitingPaused);

    // Unpause: the job is admitted on the next tick
    harness.set_flag("paused", None);
    harness.controller_tick();
    assert_eq!(harness.job("extract_data").status_code, StatusCode::Initiated);
}

#[tokio::test]
async fn retryable_task_error_reissues_task() {
    let mut harness = Harness::new();
    harness.stub.set_behaviour(rap_runner::executor::stub::StubBehaviour {
        failing_prepare: HashMap::from([("extract_data".to_string(), true)]),
        ..Default::default()
    });
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    harness.agent_tick().await;

    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::WaitingOnNewTask);
    assert_eq!(job.state, State::Pending);

    // Next tick issues a fresh task with the next attempt number
    harness.controller_tick();
    let db = harness.db.lock().unwrap();
    let tasks = db.tasks_for_job(&job.id, TaskKind::RunJob).unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(!tasks[0].active);
    assert!(tasks[1].active);
}

#[tokio::test]
async fn retry_budget_exhaustion_fails_the_job() {
    let mut harness = Harness::with_config(|config| {
        config.max_task_retries = 1;
    });
    harness.stub.set_behaviour(rap_runner::executor::stub::StubBehaviour {
        failing_prepare: HashMap::from([("extract_data".to_string(), true)]),
        ..Default::default()
    });
    harness.submit_actions("request-1", &["extract_data"]);

    for _ in 0..4 {
        harness.controller_tick();
        harness.agent_tick().await;
    }

    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::JobError);
    assert_eq!(job.state, State::Failed);
}

#[tokio::test]
async fn non_retryable_error_fails_immediately() {
    let mut harness = Harness::new();
    harness.stub.set_behaviour(rap_runner::executor::stub::StubBehaviour {
        // e.g. a dependency's outputs were deleted from disk
        failing_prepare: HashMap::from([("extract_data".to_string(), false)]),
        ..Default::default()
    });
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    harness.agent_tick().await;

    let job = harness.job("extract_data");
    assert_eq!(job.status_code, StatusCode::JobError);
    assert_eq!(job.state, State::Failed);

    let db = harness.db.lock().unwrap();
    let tasks = db.tasks_for_job(&job.id, TaskKind::RunJob).unwrap();
    assert_eq!(tasks.len(), 1, "no retry for a non-retryable failure");
}

#[tokio::test]
async fn terminal_jobs_never_change_state() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    harness.run_until_settled(30).await;
    let job = harness.job("extract_data");
    assert_eq!(job.state, State::Succeeded);

    // A stray late update must not move the job
    let update = TaskUpdate {
        task_id: format!("{}-001", job.id),
        stage: TaskStage::Executing,
        results: None,
        complete: false,
        timestamp_ns: None,
    };
    {
        let mut db = harness.db.lock().unwrap();
        rap_runner::controller::tasks::handle_task_update(
            &mut db,
            &harness.config,
            BACKEND,
            &update,
        )
        .unwrap();
    }
    let after = harness.job("extract_data");
    assert_eq!(after.state, State::Succeeded);
    assert_eq!(after.status_code, StatusCode::Succeeded);
}

#[tokio::test]
async fn task_updates_are_idempotent() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["extract_data"]);
    harness.controller_tick();
    let job = harness.job("extract_data");

    // A timestamp comfortably after the job's creation, so it is recorded
    // as-is rather than clamped
    let stamp = rap_runner::models::now_ns() + 5_000_000_000;
    let update = TaskUpdate {
        task_id: format!("{}-001", job.id),
        stage: TaskStage::Executing,
        results: None,
        complete: false,
        timestamp_ns: Some(stamp),
    };
    for _ in 0..2 {
        let mut db = harness.db.lock().unwrap();
        rap_runner::controller::tasks::handle_task_update(
            &mut db,
            &harness.config,
            BACKEND,
            &update,
        )
        .unwrap();
    }

    let after = harness.job("extract_data");
    assert_eq!(after.status_code, StatusCode::Executing);
    assert_eq!(after.status_code_updated_at, stamp);
}

#[tokio::test]
async fn job_inputs_resolve_to_succeeded_runs_only() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(40).await;
    let old_extract = harness.job("extract_data");
    assert_eq!(old_extract.state, State::Succeeded);
    let model = harness.job("run_model");

    // A newer run of the dependency action is in flight again, with no
    // outputs on disk yet; input staging must keep pointing at the
    // succeeded run.
    let mut rerun = rap_runner::testing::sample_job("extract-rerun", "request-2");
    rerun.action = "extract_data".into();
    rerun.created_at = old_extract.created_at + 100;
    {
        let mut db = harness.db.lock().unwrap();
        db.insert_job(&rerun).unwrap();
    }

    let config = harness.config.clone();
    let mut db = harness.db.lock().unwrap();
    let definition = db
        .in_transaction(|conn| {
            rap_runner::controller::tasks::job_definition(conn, &config, &model, "task-x")
        })
        .unwrap();
    assert_eq!(definition.input_job_ids, vec![old_extract.id.clone()]);
}

#[tokio::test]
async fn no_active_task_survives_a_terminal_job() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(30).await;
    harness.assert_all_terminal();

    let db = harness.db.lock().unwrap();
    assert!(db.active_tasks(BACKEND).unwrap().is_empty());
}

#[tokio::test]
async fn dbstatus_task_is_scheduled_once_per_interval() {
    let mut harness = Harness::new();
    harness.controller_tick();
    harness.controller_tick();

    let db = harness.db.lock().unwrap();
    let active = db.active_tasks(BACKEND).unwrap();
    let probes: Vec<_> = active
        .iter()
        .filter(|t| t.kind == TaskKind::DbStatus)
        .collect();
    assert_eq!(probes.len(), 1);
}
