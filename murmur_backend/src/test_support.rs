//! Shared fixtures for the unit tests: a scripted generation service, a
//! throwaway database and message seeding.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use uuid::Uuid;

use crate::config::SimSettings;
use crate::context::SimContext;
use crate::database::SimDatabase;
use crate::error::CallError;
use crate::events::{Notifier, SimEvent};
use crate::generation::{GenerationOutput, GenerationRequest, GenerationService};
use crate::model::{ChatMessage, MessageKind, Timestamp, USER_SENDER_ID};

#[derive(Default)]
pub struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<GenerationOutput, CallError>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn push_json(&self, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(GenerationOutput::Json(value)));
    }

    pub fn push_text(&self, text: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(GenerationOutput::Text(text.to_string())));
    }

    pub fn push_error(&self, err: CallError) {
        self.responses.lock().unwrap().push_back(Err(err));
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl GenerationService for ScriptedGenerator {
    async fn call(&self, request: GenerationRequest) -> Result<GenerationOutput, CallError> {
        self.requests.lock().unwrap().push(request);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(CallError::Transient("no scripted response left".to_string())))
    }
}

pub struct TestSim {
    pub ctx: SimContext,
    pub generator: Arc<ScriptedGenerator>,
    pub events: flume::Receiver<SimEvent>,
    path: PathBuf,
}

impl TestSim {
    pub fn new(name: &str) -> Self {
        Self::with_settings(name, SimSettings::default())
    }

    pub fn with_settings(name: &str, settings: SimSettings) -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("murmur_{}_{}.db", name, Uuid::new_v4()));
        let db = Arc::new(SimDatabase::new(&path).unwrap());
        let generator = Arc::new(ScriptedGenerator::default());
        let (tx, rx) = flume::unbounded();
        let ctx = SimContext::new(db, generator.clone(), Notifier::new(tx), settings);
        Self {
            ctx,
            generator,
            events: rx,
            path,
        }
    }

    pub fn db(&self) -> &SimDatabase {
        &self.ctx.db
    }

    pub fn drain_events(&self) -> Vec<SimEvent> {
        self.events.try_iter().collect()
    }
}

impl Drop for TestSim {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Insert `count` alternating user/agent text messages at 1000ms spacing,
/// starting at `start`, and bump the agent's exchange counter once per message.
pub fn seed_conversation(
    db: &SimDatabase,
    agent_id: &str,
    start: Timestamp,
    count: usize,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(count);
    for i in 0..count {
        let sender = if i % 2 == 0 { USER_SENDER_ID } else { agent_id };
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: agent_id.to_string(),
            sender_id: sender.to_string(),
            kind: MessageKind::Text,
            content: format!("message {}", i + 1),
            hidden: false,
            reactive: false,
            timestamp: start + (i as i64) * 1_000,
        };
        db.insert_message(&message).unwrap();
        db.record_exchange(agent_id).unwrap();
        messages.push(message);
    }
    messages
}

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}
