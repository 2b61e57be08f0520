//! The controller: owns the job/task database, expands job requests into
//! runnable jobs, drives the job state machine, and exposes the task API.

pub mod admin;
pub mod api;
pub mod scheduler;
pub mod sync;
pub mod tasks;

use std::sync::{Arc, Mutex};

use crate::db::Database;

/// The database is single-writer; every writer in the process shares this
/// handle and takes the lock for the duration of one short transaction.
pub type SharedDb = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}
