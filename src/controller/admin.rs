//! Operator actions: backend flags, reboot preparation, and killing jobs.
//! Invoked from the admin CLI subcommands against the controller database.

use crate::config::ControllerConfig;
use crate::db::{self, Database};
use crate::error::Result;
use crate::models::{Flag, State, StatusCode};

use super::scheduler::set_code;
use super::tasks;

pub fn show_flags(db: &Database, backend: &str) -> Result<Vec<Flag>> {
    db.current_flags(backend)
}

pub fn set_flags(
    db: &mut Database,
    backend: &str,
    pairs: &[(String, Option<String>)],
) -> Result<Vec<Flag>> {
    let mut flags = Vec::new();
    for (name, value) in pairs {
        flags.push(db.set_flag(name, value.as_deref(), backend)?);
    }
    Ok(flags)
}

/// Prepare a backend for a host reboot: pause admission, wind down every
/// running job via CANCELJOB and reset it to WAITING_ON_REBOOT. After the
/// restart the operator clears the paused flag and the jobs run again from
/// scratch.
pub fn prepare_for_reboot(
    db: &mut Database,
    config: &ControllerConfig,
    backend: &str,
) -> Result<usize> {
    db.set_flag("paused", Some("true"), backend)?;
    let running = db.running_jobs(backend)?;
    let count = running.len();
    for mut job in running {
        db.in_transaction(|conn| {
            tasks::cancel_job_task(conn, config, &job)?;
            set_code(
                conn,
                &mut job,
                StatusCode::WaitingOnReboot,
                "Waiting for backend to reboot",
                None,
            )
        })?;
        tracing::info!(job_id = %job.id, "Reset job for reboot");
    }
    Ok(count)
}

/// Kill a job outright. A running job is wound down via CANCELJOB first; the
/// terminal code is set immediately so the confirmation cannot resurrect it.
pub fn kill_job(db: &mut Database, config: &ControllerConfig, job_id: &str) -> Result<()> {
    let job = db.get_job(job_id)?;
    if job.state.is_terminal() {
        tracing::info!(job_id, "Job already terminal; nothing to kill");
        return Ok(());
    }
    db.in_transaction(|conn| {
        let Some(mut job) = db::get_job(conn, job_id)? else {
            return Ok(());
        };
        if job.state == State::Running {
            tasks::cancel_job_task(conn, config, &job)?;
        }
        set_code(
            conn,
            &mut job,
            StatusCode::KilledByAdmin,
            "Killed by admin",
            None,
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_job;
    use crate::models::TaskKind;

    fn test_config() -> ControllerConfig {
        crate::testing::controller_config(&["test"])
    }

    #[test]
    fn kill_job_is_terminal_and_sticky() {
        let mut db = Database::open_in_memory().unwrap();
        let config = test_config();
        let job = sample_job("job-1", "request-1");
        db.insert_job(&job).unwrap();

        kill_job(&mut db, &config, "job-1").unwrap();
        let killed = db.get_job("job-1").unwrap();
        assert_eq!(killed.status_code, StatusCode::KilledByAdmin);
        assert!(killed.state.is_terminal());

        // A second kill is a no-op
        kill_job(&mut db, &config, "job-1").unwrap();
    }

    #[test]
    fn prepare_for_reboot_pauses_and_resets_running_jobs() {
        let mut db = Database::open_in_memory().unwrap();
        let config = test_config();
        let mut job = sample_job("job-1", "request-1");
        job.state = State::Running;
        job.status_code = StatusCode::Executing;
        db.insert_job(&job).unwrap();
        // Simulate the task the scheduler would have issued
        db.in_transaction(|conn| tasks::create_runjob_task(conn, &config, &job).map(|_| ()))
            .unwrap();

        let count = prepare_for_reboot(&mut db, &config, "test").unwrap();
        assert_eq!(count, 1);
        assert_eq!(db.get_flag_value("paused", "test").unwrap().unwrap(), "true");

        let reset = db.get_job("job-1").unwrap();
        assert_eq!(reset.status_code, StatusCode::WaitingOnReboot);
        assert_eq!(reset.state, State::Pending);

        let cancels = db.tasks_for_job("job-1", TaskKind::CancelJob).unwrap();
        assert_eq!(cancels.len(), 1);
        assert!(cancels[0].active);
        let runjobs = db.tasks_for_job("job-1", TaskKind::RunJob).unwrap();
        assert!(!runjobs[0].active);
    }
}
