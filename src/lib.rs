pub mod api;
pub mod config;
pub mod db;
pub mod detect;
pub mod engine;
pub mod git;
pub mod ports;
pub mod proxy;
pub mod recipe;
pub mod runtime;

pub use db::DbPool;

use config::Config;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::DeploymentJob;
use crate::runtime::ContainerRuntime;

pub struct AppState {
    pub config: Arc<Config>,
    pub db: DbPool,
    pub deploy_tx: mpsc::Sender<DeploymentJob>,
    pub runtime: Arc<dyn ContainerRuntime>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        db: DbPool,
        deploy_tx: mpsc::Sender<DeploymentJob>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            config,
            db,
            deploy_tx,
            runtime,
        }
    }
}
