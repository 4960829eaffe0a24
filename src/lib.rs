//! Rigtrack equipment allocation engine
//!
//! Keeps field equipment, jobs and usage records consistent: a status state
//! machine, allocation to jobs, conflict detection and repair, usage
//! statistics, and compensating transactions over a plain CRUD repository.

use std::sync::Arc;

pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared by the worker tasks
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
