//! Job API
//!
//! HTTP trigger surface over the dispatcher (`/api/v1/*`):
//! submit, status, candidates, cancel, poll and recovery.

pub mod handlers;
mod server;
mod types;

pub use handlers::ApiState;
pub use server::{router, ApiServer};
pub use types::{ApiResponse, Empty, SubmitJobRequest, TriggerResult};
