//! Data models for the Conveyor service
//!
//! Domain models used throughout the application, organized by domain
//! (jobs, recurring schedules).

mod job;
mod schedule;

pub use job::*;
pub use schedule::*;
