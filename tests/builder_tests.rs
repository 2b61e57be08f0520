//! Tests for expanding job requests into job rows with dependency edges.

mod common;

use common::{Harness, BACKEND};
use rap_runner::models::{State, StatusCode};
use rap_runner::testing::job_request;

#[tokio::test]
async fn request_expands_into_dependency_ordered_jobs() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();

    let jobs = harness.jobs();
    assert_eq!(jobs.len(), 2);

    let extract = harness.job("extract_data");
    let model = harness.job("run_model");
    assert_eq!(extract.state, State::Pending);
    assert_eq!(model.requires_outputs_from, vec!["extract_data"]);
    assert_eq!(model.wait_for_job_ids, vec![extract.id.clone()]);
    assert!(extract.requires_db, "ehrql actions hit the database");
    assert!(!model.requires_db);
}

#[tokio::test]
async fn job_ids_are_deterministic_per_request_and_action() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();

    let extract = harness.job("extract_data");
    assert_eq!(
        extract.id,
        rap_runner::models::Job::deterministic_id("request-1", "extract_data")
    );
}

#[tokio::test]
async fn run_all_expands_every_action() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_all"]);
    harness.controller_tick();
    assert_eq!(harness.jobs().len(), 2);
}

#[tokio::test]
async fn request_is_only_expanded_once() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();
    harness.controller_tick();
    assert_eq!(harness.jobs().len(), 2);
}

#[tokio::test]
async fn in_flight_jobs_are_reused_not_duplicated() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.controller_tick();

    // A second request for the same action while the first is still pending
    harness.submit_actions("request-2", &["run_model"]);
    harness.controller_tick();

    // No new jobs: both the action and its dependency are in flight
    assert_eq!(harness.jobs().len(), 2);
}

#[tokio::test]
async fn succeeded_dependency_is_skipped_on_rerequest() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(30).await;
    harness.assert_all_terminal();

    // Re-request the downstream action only
    harness.submit_actions("request-2", &["run_model"]);
    harness.controller_tick();

    let jobs = harness.jobs();
    // one new run_model job; extract_data is not re-run
    assert_eq!(jobs.len(), 3);
    let new_model = harness.job("run_model");
    assert_eq!(new_model.job_request_id, "request-2");
    assert!(
        new_model.wait_for_job_ids.is_empty(),
        "succeeded dependency needs no waiting"
    );
}

#[tokio::test]
async fn force_run_dependencies_reruns_succeeded_deps() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_model"]);
    harness.run_until_settled(30).await;

    let mut request = job_request("request-2", BACKEND, &["run_model"]);
    request.force_run_dependencies = true;
    harness.submit(&request);
    harness.controller_tick();

    // Both actions get fresh jobs
    assert_eq!(harness.jobs().len(), 4);
    let new_model = harness.job("run_model");
    assert_eq!(new_model.wait_for_job_ids.len(), 1);
}

#[tokio::test]
async fn zero_new_jobs_marks_request_expanded() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["run_all"]);
    harness.run_until_settled(30).await;

    // Everything already succeeded; run_all again
    harness.submit_actions("request-2", &["run_all"]);
    harness.controller_tick();

    assert!(harness.jobs_for_request("request-2").is_empty());
    let db = harness.db.lock().unwrap();
    assert!(db.unexpanded_job_requests(BACKEND).unwrap().is_empty());
}

#[tokio::test]
async fn unknown_requested_action_creates_error_placeholder() {
    let mut harness = Harness::new();
    harness.submit_actions("request-1", &["does_not_exist"]);
    harness.controller_tick();

    let jobs = harness.jobs_for_request("request-1");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].action, "__error__");
    assert_eq!(jobs[0].state, State::Failed);
    assert_eq!(jobs[0].status_code, StatusCode::InvalidPipeline);
}

#[tokio::test]
async fn invalid_workspace_name_creates_error_placeholder() {
    let mut harness = Harness::new();
    let mut request = job_request("request-1", BACKEND, &["run_model"]);
    request.workspace = "bad workspace!".into();
    harness.submit(&request);
    harness.controller_tick();

    let jobs = harness.jobs_for_request("request-1");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, State::Failed);
    assert_eq!(jobs[0].status_code, StatusCode::InternalError);
}

#[tokio::test]
async fn cyclic_dependencies_fail_every_cycle_member() {
    const CYCLIC: &str = r#"
actions:
  alpha:
    run: python:latest analysis/a.py
    needs: [beta]
    outputs:
      moderately_sensitive:
        out: output/a.csv
  beta:
    run: python:latest analysis/b.py
    needs: [alpha]
    outputs:
      moderately_sensitive:
        out: output/b.csv
"#;
    let mut harness = Harness::with_project(CYCLIC);
    harness.submit_actions("request-1", &["alpha"]);
    harness.controller_tick();

    let jobs = harness.jobs_for_request("request-1");
    assert_eq!(jobs.len(), 2);
    for job in jobs {
        assert_eq!(job.state, State::Failed);
        assert_eq!(job.status_code, StatusCode::InvalidPipeline);
        assert!(job.status_message.contains("cycle"));
    }
}

#[tokio::test]
async fn stale_codelists_fail_db_requests() {
    let mut harness = Harness::new();
    let mut request = job_request("request-1", BACKEND, &["extract_data"]);
    request.codelists_ok = false;
    harness.submit(&request);
    harness.controller_tick();

    let jobs = harness.jobs_for_request("request-1");
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status_code, StatusCode::StaleCodelists);
    assert_eq!(jobs[0].state, State::Failed);
}

#[tokio::test]
async fn stale_codelists_allowed_for_non_db_actions() {
    const NO_DB: &str = r#"
actions:
  summarise:
    run: python:latest analysis/summarise.py
    outputs:
      moderately_sensitive:
        counts: output/counts.csv
"#;
    let mut harness = Harness::with_project(NO_DB);
    let mut request = job_request("request-1", BACKEND, &["summarise"]);
    request.codelists_ok = false;
    harness.submit(&request);
    harness.controller_tick();

    let job = harness.job("summarise");
    assert_eq!(job.state, State::Pending);
}
