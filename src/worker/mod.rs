//! Background job processing
//!
//! - `dispatcher`: submit / status / cancel plus the poll and recovery triggers
//! - `runner`: claim and drive one job to a terminal state
//! - `pipeline`: job parameters and the per-kind step lists
//! - `poller`: interval trigger for pending jobs

pub mod dispatcher;
pub mod pipeline;
pub mod poller;
pub mod runner;

pub use dispatcher::{Dispatcher, Worker};
pub use poller::JobPoller;
pub use runner::{JobRunner, RunOutcome, RunnerSettings};
