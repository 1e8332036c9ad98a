//! Agent action executor: one generation call, then a batch of side effects
//! applied all-or-nothing.

mod apply;
mod context;

pub use apply::{action_items, apply_action, parse_actions, ActionTarget, AgentAction};
pub use context::ActionContext;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::context::SimContext;
use crate::database::clear_reactive_on;
use crate::gate::{CallPriority, GateTicket};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum WakeScope {
    Private,
    Group { group_id: String },
}

impl WakeScope {
    pub fn conversation_id<'a>(&'a self, agent_id: &'a str) -> &'a str {
        match self {
            WakeScope::Private => agent_id,
            WakeScope::Group { group_id } => group_id,
        }
    }

    pub fn requester_key(&self, agent_id: &str) -> String {
        match self {
            WakeScope::Private => agent_key(agent_id),
            WakeScope::Group { group_id } => group_key(group_id),
        }
    }
}

pub fn agent_key(agent_id: &str) -> String {
    format!("agent:{}", agent_id)
}

pub fn group_key(group_id: &str) -> String {
    format!("group:{}", group_id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecReport {
    pub received: usize,
    pub applied: usize,
    pub skipped: usize,
}

/// Queue an independent action for `agent_id`.
pub fn wake(
    ctx: &SimContext,
    agent_id: &str,
    scope: WakeScope,
    priority: CallPriority,
) -> GateTicket<ExecReport> {
    let key = scope.requester_key(agent_id);
    let task_ctx = ctx.clone();
    let id = agent_id.to_string();
    ctx.gate
        .enqueue(priority, key, move || async move { run(&task_ctx, &id, &scope).await })
}

/// The gated body of a wake-up.
pub async fn run(ctx: &SimContext, agent_id: &str, scope: &WakeScope) -> Result<ExecReport> {
    let agent = ctx
        .db
        .get_agent(agent_id)?
        .ok_or_else(|| anyhow!("agent '{}' not found", agent_id))?;
    if let Some(status) = &agent.block_status {
        tracing::debug!("{} is {}, not acting", agent.name, status.label());
        return Ok(ExecReport::default());
    }

    let settings = ctx.settings().await;
    let action_context = ActionContext::gather(&ctx.db, &agent, scope, &settings)?;
    let response = ctx
        .generate_json(action_context.to_request(&agent))
        .await
        .with_context(|| format!("deciding actions for {}", agent.name))?;

    let (actions, unrecognised) = parse_actions(&response)?;
    let target = ActionTarget {
        agent_id: &agent.id,
        conversation_id: scope.conversation_id(&agent.id),
    };

    let events = ctx.db.transaction(|tx| {
        let mut events = Vec::new();
        for action in &actions {
            if let Some(event) = apply_action(tx, &target, action)? {
                events.push(event);
            }
        }
        // The agent has had its chance to react; don't re-wake it for the same event.
        clear_reactive_on(tx, target.conversation_id)?;
        Ok(events)
    })?;

    let no_ops = actions
        .iter()
        .filter(|action| matches!(action, AgentAction::NoOp))
        .count();
    let report = ExecReport {
        received: actions.len() + unrecognised,
        applied: events.len(),
        skipped: unrecognised + actions.len() - events.len() - no_ops,
    };
    ctx.notifier.notify_all(events);

    tracing::info!(
        "{} acted on its own: {} applied, {} skipped",
        agent.name,
        report.applied,
        report.skipped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{call_error, CallError};
    use crate::events::SimEventKind;
    use crate::generation::ResponseFormat;
    use crate::model::{BlockStatus, MessageKind, USER_SENDER_ID};
    use crate::test_support::TestSim;
    use serde_json::json;

    #[tokio::test]
    async fn applies_recognised_actions_and_notifies() {
        let sim = TestSim::new("actions_apply");
        let agent = sim.db().create_agent("Mira", "A painter").unwrap();
        let friend = sim.db().create_agent("Theo", "").unwrap();
        sim.db()
            .create_group("Studio", true, &[agent.id.clone(), friend.id.clone()])
            .unwrap();
        let post = sim.db().create_post(USER_SENDER_ID, "New easel!").unwrap();
        sim.db().add_sticker("Wave", "hello").unwrap();

        sim.generator.push_json(json!({"actions": [
            {"type": "send_message", "content": "Thinking of you"},
            {"type": "send_sticker", "sticker": "wave"},
            {"type": "like_post", "post_id": post.id},
            {"type": "comment", "post_id": post.id, "content": "Looks great"},
            {"type": "create_post", "content": "Painted the harbour today"},
            {"type": "update_relationship", "target_id": USER_SENDER_ID, "delta": 3},
            {"type": "no_op"}
        ]}));

        let report = wake(&sim.ctx, &agent.id, WakeScope::Private, CallPriority::Low)
            .await
            .unwrap();
        assert_eq!(report.received, 7);
        assert_eq!(report.applied, 6);
        assert_eq!(report.skipped, 0);

        let messages = sim.db().recent_messages(&agent.id, 10).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind, MessageKind::Sticker);
        let stored_post = sim.db().get_post(&post.id).unwrap().unwrap();
        assert_eq!(stored_post.likes, vec![agent.id.clone()]);
        assert_eq!(stored_post.comments[0].content, "Looks great");
        assert_eq!(sim.db().relationships_for(&agent.id).unwrap()[0].score, 3);

        let request = &sim.generator.requests()[0];
        assert!(request.prompt.contains("New easel!"));
        assert!(request.prompt.contains("Wave"));

        let kinds: Vec<SimEventKind> = sim.drain_events().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&SimEventKind::MessageAdded));
        assert!(kinds.contains(&SimEventKind::PostCreated));
        assert!(kinds.contains(&SimEventKind::PostUpdated));
        assert!(kinds.contains(&SimEventKind::RelationshipChanged));
    }

    #[tokio::test]
    async fn invalid_items_are_skipped_without_aborting_the_batch() {
        let sim = TestSim::new("actions_skip");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        sim.generator.push_json(json!({"actions": [
            {"type": "like_post", "post_id": "missing"},
            {"type": "send_sticker", "sticker": "nonexistent"},
            {"type": "summon_dragon"},
            {"type": "send_message", "content": "   "},
            {"type": "send_message", "content": "Still here"}
        ]}));

        let report = wake(&sim.ctx, &agent.id, WakeScope::Private, CallPriority::Low)
            .await
            .unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.skipped, 4);
        let messages = sim.db().recent_messages(&agent.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "Still here");
    }

    #[tokio::test]
    async fn non_list_response_aborts_with_zero_mutations() {
        let sim = TestSim::new("actions_abort");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        sim.generator
            .push_text("Mira decides to send a message saying hello.");

        let err = wake(&sim.ctx, &agent.id, WakeScope::Private, CallPriority::Low)
            .await
            .unwrap_err();
        assert!(matches!(call_error(&err), Some(CallError::Format { .. })));
        assert!(sim.db().recent_messages(&agent.id, 10).unwrap().is_empty());
        assert!(sim.drain_events().is_empty());
    }

    #[tokio::test]
    async fn group_scope_posts_into_group_conversation() {
        let sim = TestSim::new("actions_group");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        let other = sim.db().create_agent("Theo", "").unwrap();
        let group = sim
            .db()
            .create_group("Studio", true, &[agent.id.clone(), other.id.clone()])
            .unwrap();
        sim.generator
            .push_json(json!([{"type": "send_message", "content": "Morning all"}]));

        let scope = WakeScope::Group {
            group_id: group.id.clone(),
        };
        let ticket = wake(&sim.ctx, &agent.id, scope, CallPriority::Low);
        assert!(sim.ctx.gate.is_queued(&group_key(&group.id)));
        ticket.await.unwrap();

        let messages = sim.db().recent_messages(&group.id, 10).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender_id, agent.id);
        assert!(sim.db().recent_messages(&agent.id, 10).unwrap().is_empty());
        assert!(sim.generator.requests()[0].prompt.contains("Studio"));
    }

    #[tokio::test]
    async fn blocked_agent_does_not_call_the_generator() {
        let sim = TestSim::new("actions_blocked");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        sim.db()
            .set_block_status(&agent.id, Some(BlockStatus::BlockedByUser { since: 0 }))
            .unwrap();

        let report = wake(&sim.ctx, &agent.id, WakeScope::Private, CallPriority::Low)
            .await
            .unwrap();
        assert_eq!(report, ExecReport::default());
        assert_eq!(sim.generator.call_count(), 0);
    }

    #[tokio::test]
    async fn prompt_asks_for_the_object_shape_the_parser_accepts() {
        let sim = TestSim::new("actions_shape");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        let settings = sim.ctx.settings().await;
        let request = ActionContext::gather(&sim.ctx.db, &agent, &WakeScope::Private, &settings)
            .unwrap()
            .to_request(&agent);

        assert_eq!(request.format, ResponseFormat::Json);
        assert!(request.prompt.contains(context::RESPONSE_EXAMPLE));
        let example: serde_json::Value = serde_json::from_str(context::RESPONSE_EXAMPLE).unwrap();
        assert!(example.is_object());
        let (actions, unrecognised) = parse_actions(&example).unwrap();
        assert_eq!(unrecognised, 0);
        assert!(matches!(actions[0], AgentAction::SendMessage { .. }));
    }
}
