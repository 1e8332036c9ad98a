use flume::Sender;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimEventKind {
    MessageAdded,
    PostCreated,
    PostUpdated,
    AgentUpdated,
    RelationshipChanged,
    SummaryCreated,
}

/// Cross-view notification: something with this id changed, go re-read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimEvent {
    #[serde(rename = "type")]
    pub kind: SimEventKind,
    pub id: String,
}

impl SimEvent {
    pub fn new(kind: SimEventKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

/// Fire-and-forget broadcaster. Nobody listening is not an error.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<SimEvent>,
}

impl Notifier {
    pub fn new(tx: Sender<SimEvent>) -> Self {
        Self { tx }
    }

    pub fn notify(&self, kind: SimEventKind, id: impl Into<String>) {
        let _ = self.tx.send(SimEvent::new(kind, id));
    }

    pub fn notify_all<I>(&self, events: I)
    where
        I: IntoIterator<Item = SimEvent>,
    {
        for event in events {
            let _ = self.tx.send(event);
        }
    }
}
