//! Shared harness: an in-process controller (scheduler + database) wired to
//! an agent loop running against the stub executor.
#![allow(dead_code)]

use std::sync::Arc;

use rap_runner::agent::AgentLoop;
use rap_runner::builder::ProjectSource;
use rap_runner::config::ControllerConfig;
use rap_runner::controller::scheduler::Scheduler;
use rap_runner::controller::{shared, SharedDb};
use rap_runner::db::Database;
use rap_runner::executor::StubExecutor;
use rap_runner::models::{Job, JobRequest, State};
use rap_runner::testing::{
    agent_config, controller_config, job_request, InProcessClient, StaticProjectSource,
    TEST_PROJECT,
};

pub const BACKEND: &str = "test";

pub struct Harness {
    pub db: SharedDb,
    pub config: Arc<ControllerConfig>,
    pub scheduler: Scheduler,
    pub stub: StubExecutor,
    pub agent: AgentLoop<StubExecutor, InProcessClient>,
    _tmp: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(TEST_PROJECT, |_| {})
    }

    pub fn with_project(project: &str) -> Self {
        Self::build(project, |_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut ControllerConfig)) -> Self {
        Self::build(TEST_PROJECT, tweak)
    }

    pub fn build(project: &str, tweak: impl FnOnce(&mut ControllerConfig)) -> Self {
        let mut config = controller_config(&[BACKEND]);
        tweak(&mut config);
        let config = Arc::new(config);
        let db = shared(Database::open_in_memory().expect("in-memory database"));
        let source: Arc<dyn ProjectSource> = Arc::new(StaticProjectSource::new(project));
        let scheduler = Scheduler::new(db.clone(), (*config).clone(), source);

        let tmp = tempfile::tempdir().expect("tempdir");
        let stub = StubExecutor::new();
        let client = InProcessClient {
            db: db.clone(),
            config: config.clone(),
            backend: BACKEND.to_string(),
        };
        let agent = AgentLoop::new(stub.clone(), client, agent_config(BACKEND, tmp.path()));

        Harness {
            db,
            config,
            scheduler,
            stub,
            agent,
            _tmp: tmp,
        }
    }

    pub fn submit(&self, request: &JobRequest) {
        let mut db = self.db.lock().unwrap();
        db.upsert_job_request(request).expect("insert job request");
    }

    pub fn submit_actions(&self, request_id: &str, actions: &[&str]) -> JobRequest {
        let request = job_request(request_id, BACKEND, actions);
        self.submit(&request);
        request
    }

    pub fn controller_tick(&mut self) {
        self.scheduler.tick().expect("scheduler tick");
    }

    pub async fn agent_tick(&mut self) {
        self.agent.tick().await.expect("agent tick");
    }

    pub fn jobs(&self) -> Vec<Job> {
        let db = self.db.lock().unwrap();
        db.all_jobs(BACKEND).expect("jobs")
    }

    pub fn jobs_for_request(&self, request_id: &str) -> Vec<Job> {
        let db = self.db.lock().unwrap();
        db.jobs_for_request(request_id).expect("jobs for request")
    }

    /// The job for an action, preferring a non-terminal one when several
    /// requests have produced jobs for the same action.
    pub fn job(&self, action: &str) -> Job {
        let jobs: Vec<Job> = self
            .jobs()
            .into_iter()
            .filter(|j| j.action == action)
            .collect();
        jobs.iter()
            .find(|j| !j.state.is_terminal())
            .cloned()
            .or_else(|| jobs.last().cloned())
            .unwrap_or_else(|| panic!("no job for action {action}"))
    }

    pub fn set_cancelled(&self, request_id: &str, actions: &[&str]) {
        let actions: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        let mut db = self.db.lock().unwrap();
        db.set_cancelled_flags(request_id, &actions)
            .expect("set cancelled");
    }

    pub fn set_flag(&self, name: &str, value: Option<&str>) {
        let mut db = self.db.lock().unwrap();
        db.set_flag(name, value, BACKEND).expect("set flag");
    }

    pub fn flag(&self, name: &str) -> Option<String> {
        let db = self.db.lock().unwrap();
        db.get_flag_value(name, BACKEND).expect("get flag")
    }

    /// Alternate controller and agent ticks, finishing any container that
    /// reaches EXECUTING, until every job is terminal (or the iteration
    /// budget runs out).
    pub async fn run_until_settled(&mut self, max_iterations: usize) {
        for _ in 0..max_iterations {
            self.controller_tick();
            self.agent_tick().await;
            let jobs = self.jobs();
            for job in &jobs {
                self.stub.finish_execution(&job.id);
            }
            if !jobs.is_empty() && jobs.iter().all(|j| j.state.is_terminal()) {
                return;
            }
        }
    }

    pub fn assert_all_terminal(&self) {
        for job in self.jobs() {
            assert!(
                job.state.is_terminal(),
                "job {} ({}) still {:?}",
                job.id,
                job.action,
                job.state
            );
        }
    }
}

pub fn active_states(jobs: &[Job]) -> Vec<(String, State)> {
    jobs.iter()
        .map(|j| (j.action.clone(), j.state))
        .collect()
}
