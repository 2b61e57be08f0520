//! The agent: one process per backend, pulling tasks from the controller
//! and driving the executor through task stages.

pub mod client;
pub mod runner;

pub use client::{ControllerClient, HttpControllerClient};
pub use runner::AgentLoop;
