use std::sync::Arc;

use anyhow::{Context, Result};
use flume::Sender;

use crate::config::BackendConfig;
use crate::context::SimContext;
use crate::database::SimDatabase;
use crate::events::{Notifier, SimEvent};
use crate::generation::GenerationService;
use crate::heartbeat::Heartbeat;
use crate::llm_client::LlmClient;

pub struct SimRuntime {
    pub config: BackendConfig,
    pub ctx: SimContext,
    pub heartbeat: Arc<Heartbeat>,
}

pub struct SimRuntimeBuilder {
    config: BackendConfig,
    event_tx: Sender<SimEvent>,
    generator: Option<Arc<dyn GenerationService>>,
}

impl SimRuntimeBuilder {
    pub fn new(config: BackendConfig, event_tx: Sender<SimEvent>) -> Self {
        Self {
            config,
            event_tx,
            generator: None,
        }
    }

    /// Replace the OpenAI-compatible client with another generation service.
    pub fn with_generator(mut self, generator: Arc<dyn GenerationService>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn build(self) -> Result<SimRuntime> {
        let config = self.config;
        let db = SimDatabase::new(&config.database_path)
            .with_context(|| format!("Failed to open database at {}", config.database_path))?;

        let generator = match self.generator {
            Some(generator) => generator,
            None => {
                tracing::info!(
                    "Using LLM endpoint {} (model {})",
                    config.llm_api_url,
                    config.llm_model
                );
                Arc::new(LlmClient::from_config(&config))
            }
        };

        let ctx = SimContext::new(
            Arc::new(db),
            generator,
            Notifier::new(self.event_tx),
            config.simulation.clone().sanitized(),
        );
        let heartbeat = Arc::new(Heartbeat::new(ctx.clone()));

        Ok(SimRuntime {
            config,
            ctx,
            heartbeat,
        })
    }
}

impl SimRuntime {
    pub fn bootstrap(config: BackendConfig, event_tx: Sender<SimEvent>) -> Result<Self> {
        SimRuntimeBuilder::new(config, event_tx).build()
    }

    /// Start the heartbeat if background activity is enabled in settings.
    pub async fn start_background(&self) -> bool {
        if !self.ctx.settings().await.enable_background_activity {
            tracing::info!("Background activity disabled; heartbeat not started");
            return false;
        }
        self.heartbeat.start().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimSettings;
    use crate::test_support::ScriptedGenerator;
    use uuid::Uuid;

    fn temp_config(enabled: bool) -> BackendConfig {
        let mut path = std::env::temp_dir();
        path.push(format!("murmur_runtime_{}.db", Uuid::new_v4()));
        BackendConfig {
            database_path: path.to_string_lossy().to_string(),
            simulation: SimSettings {
                enable_background_activity: enabled,
                ..SimSettings::default()
            },
            ..BackendConfig::default()
        }
    }

    #[tokio::test]
    async fn builds_with_custom_generator_and_respects_enable_flag() {
        let config = temp_config(false);
        let db_path = config.database_path.clone();
        let (tx, _rx) = flume::unbounded();
        let runtime = SimRuntimeBuilder::new(config, tx)
            .with_generator(Arc::new(ScriptedGenerator::default()))
            .build()
            .unwrap();

        assert!(!runtime.start_background().await);
        assert!(!runtime.heartbeat.is_running());
        assert!(runtime.ctx.db.list_agents().unwrap().is_empty());

        drop(runtime);
        let _ = std::fs::remove_file(db_path);
    }

    #[tokio::test]
    async fn enabled_runtime_starts_heartbeat() {
        let config = temp_config(true);
        let db_path = config.database_path.clone();
        let (tx, _rx) = flume::unbounded();
        let runtime = SimRuntime::bootstrap(config, tx).unwrap();

        assert!(runtime.start_background().await);
        assert!(runtime.heartbeat.is_running());
        runtime.heartbeat.stop();
        assert!(!runtime.heartbeat.is_running());

        drop(runtime);
        let _ = std::fs::remove_file(db_path);
    }
}
