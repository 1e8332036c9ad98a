use rusqlite::Connection;
use serde::Deserialize;
use serde_json::Value;

use crate::database::{
    adjust_relationship_on, append_message_on, comment_on_post_on, create_post_on,
    find_sticker_on, like_post_on, load_agent_on, load_post_on,
};
use crate::error::CallError;
use crate::events::{SimEvent, SimEventKind};
use crate::model::{MessageKind, USER_SENDER_ID};

/// One step the agent decided to take, as tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentAction {
    SendMessage { content: String },
    SendSticker { sticker: String },
    CreatePost { content: String },
    LikePost { post_id: String },
    Comment { post_id: String, content: String },
    UpdateRelationship { target_id: String, delta: i64 },
    NoOp,
}

/// Accept a bare array, or an object wrapping it under `actions`.
pub fn action_items(value: &Value) -> Result<&Vec<Value>, CallError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => match map.get("actions") {
            Some(Value::Array(items)) => Ok(items),
            _ => Err(CallError::format(
                "expected a list of actions",
                &value.to_string(),
            )),
        },
        _ => Err(CallError::format(
            "expected a list of actions",
            &value.to_string(),
        )),
    }
}

/// Typed actions plus the number of items that were not recognised.
/// A non-empty list with nothing recognisable is treated as a bad response.
pub fn parse_actions(value: &Value) -> Result<(Vec<AgentAction>, usize), CallError> {
    let items = action_items(value)?;
    let mut actions = Vec::with_capacity(items.len());
    let mut skipped = 0;
    for item in items {
        match serde_json::from_value::<AgentAction>(item.clone()) {
            Ok(action) => actions.push(action),
            Err(e) => {
                tracing::debug!("Skipping unrecognised action {}: {}", item, e);
                skipped += 1;
            }
        }
    }
    if actions.is_empty() && skipped > 0 {
        return Err(CallError::format(
            "no recognised actions in list",
            &value.to_string(),
        ));
    }
    Ok((actions, skipped))
}

/// Where the agent is acting.
pub struct ActionTarget<'a> {
    pub agent_id: &'a str,
    pub conversation_id: &'a str,
}

/// Apply one action on an open transaction. `Ok(None)` means the action was
/// well-formed but pointed at nothing usable and was skipped.
pub fn apply_action(
    conn: &Connection,
    target: &ActionTarget<'_>,
    action: &AgentAction,
) -> anyhow::Result<Option<SimEvent>> {
    let event = match action {
        AgentAction::NoOp => None,
        AgentAction::SendMessage { content } => {
            let content = content.trim();
            if content.is_empty() {
                return Ok(None);
            }
            append_message_on(
                conn,
                target.conversation_id,
                target.agent_id,
                MessageKind::Text,
                content,
            )?;
            Some(SimEvent::new(
                SimEventKind::MessageAdded,
                target.conversation_id,
            ))
        }
        AgentAction::SendSticker { sticker } => {
            let Some(sticker) = find_sticker_on(conn, sticker)? else {
                return Ok(None);
            };
            append_message_on(
                conn,
                target.conversation_id,
                target.agent_id,
                MessageKind::Sticker,
                &sticker.name,
            )?;
            Some(SimEvent::new(
                SimEventKind::MessageAdded,
                target.conversation_id,
            ))
        }
        AgentAction::CreatePost { content } => {
            let content = content.trim();
            if content.is_empty() {
                return Ok(None);
            }
            let post = create_post_on(conn, target.agent_id, content)?;
            Some(SimEvent::new(SimEventKind::PostCreated, post.id))
        }
        AgentAction::LikePost { post_id } => {
            if load_post_on(conn, post_id)?.is_none() {
                return Ok(None);
            }
            if !like_post_on(conn, post_id, target.agent_id)? {
                return Ok(None);
            }
            Some(SimEvent::new(SimEventKind::PostUpdated, post_id.clone()))
        }
        AgentAction::Comment { post_id, content } => {
            let content = content.trim();
            if content.is_empty() || load_post_on(conn, post_id)?.is_none() {
                return Ok(None);
            }
            comment_on_post_on(conn, post_id, target.agent_id, content)?;
            Some(SimEvent::new(SimEventKind::PostUpdated, post_id.clone()))
        }
        AgentAction::UpdateRelationship { target_id, delta } => {
            let known = target_id == USER_SENDER_ID || load_agent_on(conn, target_id)?.is_some();
            if !known || target_id == target.agent_id || *delta == 0 {
                return Ok(None);
            }
            adjust_relationship_on(conn, target.agent_id, target_id, *delta)?;
            Some(SimEvent::new(
                SimEventKind::RelationshipChanged,
                target.agent_id,
            ))
        }
    };
    Ok(event)
}
