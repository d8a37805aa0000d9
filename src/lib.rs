pub mod config;
pub mod db;
pub mod events;
pub mod generator;
pub mod hub;
pub mod routes;
pub mod session;
pub mod task;
pub mod worker;

use std::sync::Arc;

use tokio::sync::Notify;

use db::TaskStore;
use hub::BroadcastHub;

/// Shared handles every request and session works with.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub hub: BroadcastHub,
    /// Signalled on every enqueue so an idle worker polls immediately.
    pub wake: Arc<Notify>,
    pub history_limit: usize,
}
