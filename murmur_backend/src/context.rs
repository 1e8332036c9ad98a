use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::config::SimSettings;
use crate::database::SimDatabase;
use crate::error::log_background_failure;
use crate::events::Notifier;
use crate::gate::{CallGate, GateTicket};
use crate::generation::{GenerationRequest, GenerationService};

/// Everything a background task needs, cheap to clone into a gate action.
#[derive(Clone)]
pub struct SimContext {
    pub db: Arc<SimDatabase>,
    pub gate: CallGate,
    pub generator: Arc<dyn GenerationService>,
    pub notifier: Notifier,
    pub settings: Arc<RwLock<SimSettings>>,
}

impl SimContext {
    pub fn new(
        db: Arc<SimDatabase>,
        generator: Arc<dyn GenerationService>,
        notifier: Notifier,
        settings: SimSettings,
    ) -> Self {
        let gate = CallGate::new(Duration::from_secs(settings.generation_timeout_secs));
        Self {
            db,
            gate,
            generator,
            notifier,
            settings: Arc::new(RwLock::new(settings)),
        }
    }

    /// Copy of the current settings. Callers take one per tick or task so a
    /// concurrent update cannot change knobs halfway through.
    pub async fn settings(&self) -> SimSettings {
        self.settings.read().await.clone()
    }

    pub async fn replace_settings(&self, settings: SimSettings) {
        let settings = settings.sanitized();
        self.gate
            .set_deadline(Duration::from_secs(settings.generation_timeout_secs));
        *self.settings.write().await = settings;
    }

    /// One JSON generation call. Must only be used from inside a gate action.
    pub async fn generate_json(&self, request: GenerationRequest) -> Result<Value> {
        let output = self.generator.call(request).await?;
        Ok(output.into_json()?)
    }
}

/// Await a background ticket off to the side and log its failure by class.
pub fn watch_background<T: Send + 'static>(task: String, ticket: GateTicket<T>) {
    tokio::spawn(async move {
        if let Err(e) = ticket.await {
            log_background_failure(&task, &e);
        }
    });
}
