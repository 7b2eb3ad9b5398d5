use crate::prelude::*;

use crate::admission::AdmissionController;
use crate::batch::BatchEngine;
use crate::config::Config;
use crate::resilience::ResilientExecutor;
use crate::world::World;

/// Everything a command handler may touch. Built once at startup and shared.
pub struct Services {
    pub world: Arc<dyn World>,
    pub admission: Arc<AdmissionController>,
    pub resilience: ResilientExecutor,
    pub batch: Arc<BatchEngine>,
    pub metrics: Arc<dyn Metrics>,
    pub config: Config,
}

impl Services {
    pub fn new(config: Config, world: Arc<dyn World>, metrics: Arc<dyn Metrics>) -> Self {
        Self {
            admission: Arc::new(AdmissionController::new(
                config.admission.clone(),
                Arc::clone(&metrics),
            )),
            resilience: ResilientExecutor::new(config.resilience.clone(), Arc::clone(&metrics)),
            batch: Arc::new(BatchEngine::new(
                Arc::clone(&world),
                config.batch.clone(),
                Arc::clone(&metrics),
            )),
            world,
            metrics,
            config,
        }
    }

    /// Starts background upkeep. Needs a tokio runtime.
    pub fn start(&self) {
        self.admission.start_sweeper();
    }

    pub async fn shutdown(&self) {
        let grace = self.config.server.shutdown_grace();
        log::info!("shutting down (grace {grace:?})");
        tokio::join!(self.admission.shutdown(grace), self.batch.shutdown(grace));
    }
}
