use std::sync::Arc;

use crate::cleanup::Cleanup;
use crate::config::Config;
use crate::orchestrator::Orchestrator;

// --- Modules ---
pub mod classifier;
pub mod cleanup;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod events;
pub mod filename;
pub mod handlers;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod pool;
pub mod quality;
pub mod store;
pub mod strategy;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<Config>,
    pub cleanup: Arc<Cleanup>,
}
