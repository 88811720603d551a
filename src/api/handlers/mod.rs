//! HTTP handlers for the API

pub mod health;
pub mod jobs;
pub mod metrics;
pub mod schedules;
