use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::config::SimSettings;
use crate::database::SimDatabase;
use crate::generation::{GenerationRequest, Message};
use crate::model::{
    format_timestamp, Agent, ChatMessage, FeedPost, Group, MessageKind, Relationship, Sticker,
    USER_SENDER_ID,
};

use super::WakeScope;

/// JSON mode only allows an object at the top level, so actions are wrapped.
pub const RESPONSE_EXAMPLE: &str = r#"{"actions": [{"type": "send_message", "content": "..."}]}"#;

/// Bounded snapshot of what one agent knows right before it acts.
pub struct ActionContext {
    pub group: Option<Group>,
    pub relationships: Vec<Relationship>,
    pub messages: Vec<ChatMessage>,
    pub posts: Vec<FeedPost>,
    pub stickers: Vec<Sticker>,
    names: HashMap<String, String>,
}

impl ActionContext {
    pub fn gather(
        db: &SimDatabase,
        agent: &Agent,
        scope: &WakeScope,
        settings: &SimSettings,
    ) -> Result<Self> {
        let group = match scope {
            WakeScope::Private => None,
            WakeScope::Group { group_id } => Some(
                db.get_group(group_id)?
                    .ok_or_else(|| anyhow!("group '{}' not found", group_id))?,
            ),
        };
        let conversation_id = scope.conversation_id(&agent.id);

        let names = db
            .list_agents()?
            .into_iter()
            .map(|a| (a.id, a.name))
            .collect();

        Ok(Self {
            group,
            relationships: db.relationships_for(&agent.id)?,
            messages: db
                .recent_messages(conversation_id, settings.context_message_limit)?
                .into_iter()
                .filter(|m| !m.hidden)
                .collect(),
            posts: db.visible_posts(&agent.id, settings.feed_context_limit)?,
            stickers: db.list_stickers()?,
            names,
        })
    }

    fn name_of<'a>(&'a self, id: &'a str) -> &'a str {
        if id == USER_SENDER_ID {
            return "User";
        }
        self.names.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn to_request(&self, agent: &Agent) -> GenerationRequest {
        let mut prompt = format!(
            "You are {name}. {persona}\n\n\
             The user is away. Decide what, if anything, {name} does on their own right now.",
            name = agent.name,
            persona = agent.persona.trim(),
        );

        if let Some(group) = &self.group {
            let members: Vec<&str> = group.members.iter().map(|id| self.name_of(id)).collect();
            prompt.push_str(&format!(
                "\nYou are in the group chat \"{}\" with: {}.",
                group.name,
                members.join(", ")
            ));
        }

        if !self.relationships.is_empty() {
            prompt.push_str("\n\nHow you feel about others (-100 to 100):");
            for rel in &self.relationships {
                prompt.push_str(&format!(
                    "\n- {} ({}): {}",
                    self.name_of(&rel.other_id),
                    rel.other_id,
                    rel.score
                ));
            }
        }

        if !self.posts.is_empty() {
            prompt.push_str("\n\nRecent feed posts:");
            for post in &self.posts {
                prompt.push_str(&format!(
                    "\n- [{}] {} at {}: {} ({} likes, {} comments)",
                    post.id,
                    self.name_of(&post.author_id),
                    format_timestamp(post.created_at),
                    post.content,
                    post.likes.len(),
                    post.comments.len()
                ));
            }
        }

        if !self.stickers.is_empty() {
            let names: Vec<&str> = self.stickers.iter().map(|s| s.name.as_str()).collect();
            prompt.push_str(&format!("\n\nStickers you can send: {}", names.join(", ")));
        }

        prompt.push_str("\n\nRespond with a JSON object holding a list of actions, for example ");
        prompt.push_str(RESPONSE_EXAMPLE);
        prompt.push_str(
            ". Allowed actions:\n\
             {\"type\": \"send_message\", \"content\": \"...\"}\n\
             {\"type\": \"send_sticker\", \"sticker\": \"<sticker name>\"}\n\
             {\"type\": \"create_post\", \"content\": \"...\"}\n\
             {\"type\": \"like_post\", \"post_id\": \"...\"}\n\
             {\"type\": \"comment\", \"post_id\": \"...\", \"content\": \"...\"}\n\
             {\"type\": \"update_relationship\", \"target_id\": \"...\", \"delta\": 5}\n\
             {\"type\": \"no_op\"}",
        );

        let history = self
            .messages
            .iter()
            .map(|message| {
                let line = match message.kind {
                    MessageKind::Sticker => format!("[sticker: {}]", message.content),
                    _ => message.content.clone(),
                };
                if message.sender_id == agent.id {
                    Message::assistant(line)
                } else {
                    Message::user(format!("{}: {}", self.name_of(&message.sender_id), line))
                }
            })
            .collect();

        GenerationRequest::json(prompt, history)
    }
}
