//! Conveyor Library
//!
//! This library exposes the core components for testing and embedding.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod worker;
