use anyhow::{anyhow, Context, Result};
use serde_json::Value;

use crate::actions::agent_key;
use crate::context::{watch_background, SimContext};
use crate::error::CallError;
use crate::events::SimEventKind;
use crate::gate::CallPriority;
use crate::generation::{GenerationRequest, Message};
use crate::model::{format_timestamp, now_millis, Agent, BlockStatus, Timestamp, USER_SENDER_ID};

const RECONCILE_HISTORY: usize = 10;

/// Move a cooled-down block into `pending_system_reflection` and queue the
/// reflection call. The new status is persisted first, so later ticks see it
/// and never start a second reflection for the same block.
pub fn begin(ctx: &SimContext, agent_id: &str, now: Timestamp) -> Result<bool> {
    let moved = ctx
        .db
        .update_agent(agent_id, |agent| match agent.block_status {
            Some(BlockStatus::BlockedByUser { .. }) => {
                agent.block_status = Some(BlockStatus::PendingSystemReflection { since: now });
                true
            }
            _ => false,
        })?
        .unwrap_or(false);
    if !moved {
        return Ok(false);
    }
    ctx.notifier.notify(SimEventKind::AgentUpdated, agent_id);

    let key = agent_key(agent_id);
    let task_ctx = ctx.clone();
    let id = agent_id.to_string();
    let ticket = ctx
        .gate
        .enqueue(CallPriority::Low, key, move || async move {
            reconcile(&task_ctx, &id).await
        });
    watch_background(format!("reconcile:{}", agent_id), ticket);
    Ok(true)
}

/// Ask the agent whether it wants to reach out again. Success with a reason
/// leads to `pending_user_approval`; a decline or any failure re-arms the
/// block with a fresh timestamp. The failure is still returned for logging.
pub async fn reconcile(ctx: &SimContext, agent_id: &str) -> Result<BlockStatus> {
    // Dropped mid-call when the gate deadline fires; the guard re-arms then.
    let mut guard = ReflectionGuard::new(ctx, agent_id);
    let agent = ctx
        .db
        .get_agent(agent_id)?
        .ok_or_else(|| anyhow!("agent '{}' not found", agent_id))?;

    let outcome = ask(ctx, &agent).await;
    guard.disarm();

    let next = match &outcome {
        Ok(Some(reason)) => {
            let next = BlockStatus::PendingUserApproval {
                reason: reason.clone(),
                requested_at: now_millis(),
            };
            if settle(ctx, agent_id, next.clone())? {
                tracing::info!("{} asked to talk again", agent.name);
            }
            next
        }
        _ => {
            let since = now_millis();
            if settle(ctx, agent_id, BlockStatus::BlockedByUser { since })? {
                tracing::info!("{} stays blocked for another cooldown", agent.name);
            }
            BlockStatus::BlockedByUser { since }
        }
    };

    outcome.with_context(|| format!("reconciliation for {}", agent.name))?;
    Ok(next)
}

/// Put a block that is still waiting on its reflection back into cooldown.
pub fn rearm(ctx: &SimContext, agent_id: &str) -> Result<bool> {
    settle(ctx, agent_id, BlockStatus::BlockedByUser { since: now_millis() })
}

/// Re-arm reflections that no gate task will ever finish: the process went
/// down between `begin` and the call, or the task vanished some other way.
/// Returns the ids that were moved back to `blocked_by_user`.
pub fn recover_orphaned(
    ctx: &SimContext,
    agents: &[Agent],
    stale_after_millis: i64,
    now: Timestamp,
) -> Vec<String> {
    let mut recovered = Vec::new();
    for agent in agents {
        let Some(BlockStatus::PendingSystemReflection { since }) = &agent.block_status else {
            continue;
        };
        if now.saturating_sub(*since) < stale_after_millis || ctx.gate.is_queued(&agent_key(&agent.id)) {
            continue;
        }
        match rearm(ctx, &agent.id) {
            Ok(true) => {
                tracing::warn!("{} was stuck waiting on a reflection, re-armed its block", agent.name);
                recovered.push(agent.id.clone());
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("Could not re-arm block for {}: {:#}", agent.name, e),
        }
    }
    recovered
}

/// Apply `next` only while the agent is still in `pending_system_reflection`.
/// The user may have unblocked in the meantime; that is left alone.
fn settle(ctx: &SimContext, agent_id: &str, next: BlockStatus) -> Result<bool> {
    let applied = ctx
        .db
        .update_agent(agent_id, |a| {
            if matches!(a.block_status, Some(BlockStatus::PendingSystemReflection { .. })) {
                a.block_status = Some(next);
                true
            } else {
                false
            }
        })?
        .unwrap_or(false);
    if applied {
        ctx.notifier.notify(SimEventKind::AgentUpdated, agent_id);
    }
    Ok(applied)
}

struct ReflectionGuard<'a> {
    ctx: &'a SimContext,
    agent_id: &'a str,
    armed: bool,
}

impl<'a> ReflectionGuard<'a> {
    fn new(ctx: &'a SimContext, agent_id: &'a str) -> Self {
        Self {
            ctx,
            agent_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReflectionGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match rearm(self.ctx, self.agent_id) {
            Ok(true) => tracing::warn!("Reflection for {} was cut short, block re-armed", self.agent_id),
            Ok(false) => {}
            Err(e) => tracing::error!("Could not re-arm block for {}: {:#}", self.agent_id, e),
        }
    }
}

async fn ask(ctx: &SimContext, agent: &Agent) -> Result<Option<String>> {
    let since = match &agent.block_status {
        Some(BlockStatus::PendingSystemReflection { since })
        | Some(BlockStatus::BlockedByUser { since }) => *since,
        _ => now_millis(),
    };

    let prompt = format!(
        "You are {name}. {persona}\n\n\
         The user blocked you a while ago (around {since}). Some time has passed. \
         Reflect on the last conversation and decide whether you sincerely want to \
         ask the user to talk again.\n\n\
         Respond with JSON only: {{\"reconcile\": true|false, \"reason\": \"what you would say to the user\"}}",
        name = agent.name,
        persona = agent.persona.trim(),
        since = format_timestamp(since),
    );

    let history = ctx
        .db
        .recent_messages(&agent.id, RECONCILE_HISTORY)?
        .into_iter()
        .filter(|m| !m.hidden)
        .map(|m| {
            if m.sender_id == USER_SENDER_ID {
                Message::user(m.content)
            } else {
                Message::assistant(m.content)
            }
        })
        .collect();

    let response = ctx
        .generate_json(GenerationRequest::json(prompt, history))
        .await?;
    Ok(parse_decision(&response)?)
}

fn parse_decision(value: &Value) -> Result<Option<String>, CallError> {
    let reconcile = value
        .get("reconcile")
        .and_then(Value::as_bool)
        .ok_or_else(|| CallError::Validation("missing boolean 'reconcile'".to_string()))?;
    let reason = value
        .get("reason")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default();
    Ok((reconcile && !reason.is_empty()).then(|| reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimSettings;
    use crate::error::CallError;
    use crate::generation::{GenerationOutput, GenerationService};
    use crate::test_support::TestSim;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    /// Never answers within any sane deadline.
    struct StallingGenerator;

    #[async_trait]
    impl GenerationService for StallingGenerator {
        async fn call(&self, _request: GenerationRequest) -> Result<GenerationOutput, CallError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(CallError::Transient("too slow".to_string()))
        }
    }

    fn blocked_agent(sim: &TestSim, status: BlockStatus) -> Agent {
        let agent = sim.db().create_agent("Mira", "").unwrap();
        sim.db().set_block_status(&agent.id, Some(status)).unwrap();
        agent
    }

    #[tokio::test(start_paused = true)]
    async fn reflection_cut_off_by_deadline_rearms_the_block() {
        let settings = SimSettings {
            generation_timeout_secs: 1,
            ..SimSettings::default()
        };
        let sim = TestSim::with_settings("reconcile_deadline", settings);
        let agent = blocked_agent(&sim, BlockStatus::BlockedByUser { since: 1 });
        let ctx = SimContext {
            generator: Arc::new(StallingGenerator),
            ..sim.ctx.clone()
        };

        let before = now_millis();
        assert!(begin(&ctx, &agent.id, before).unwrap());
        ctx.gate.wait_idle().await;

        match sim.db().get_agent(&agent.id).unwrap().unwrap().block_status {
            Some(BlockStatus::BlockedByUser { since }) => assert!(since >= before),
            other => panic!("unexpected status: {other:?}"),
        }
    }

    #[tokio::test]
    async fn orphaned_reflection_is_recovered_once_stale() {
        let sim = TestSim::new("reconcile_orphan");
        let now = now_millis();
        let stale = blocked_agent(&sim, BlockStatus::PendingSystemReflection { since: now - 600_000 });
        let fresh = sim.db().create_agent("Theo", "").unwrap();
        sim.db()
            .set_block_status(&fresh.id, Some(BlockStatus::PendingSystemReflection { since: now }))
            .unwrap();

        let agents = sim.db().list_agents().unwrap();
        let recovered = recover_orphaned(&sim.ctx, &agents, 60_000, now);
        assert_eq!(recovered, vec![stale.id.clone()]);

        assert!(matches!(
            sim.db().get_agent(&stale.id).unwrap().unwrap().block_status,
            Some(BlockStatus::BlockedByUser { .. })
        ));
        assert!(matches!(
            sim.db().get_agent(&fresh.id).unwrap().unwrap().block_status,
            Some(BlockStatus::PendingSystemReflection { .. })
        ));
    }

    #[tokio::test]
    async fn queued_reflection_is_not_treated_as_orphaned() {
        let sim = TestSim::new("reconcile_queued");
        let agent = blocked_agent(&sim, BlockStatus::PendingSystemReflection { since: 0 });
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let held = sim.ctx.gate.enqueue(CallPriority::Low, agent_key(&agent.id), move || async move {
            let _ = release_rx.await;
            Ok(())
        });

        let agents = sim.db().list_agents().unwrap();
        assert!(recover_orphaned(&sim.ctx, &agents, 1_000, now_millis()).is_empty());

        release_tx.send(()).unwrap();
        held.await.unwrap();
    }

    #[tokio::test]
    async fn unblocked_agent_is_left_alone_by_rearm() {
        let sim = TestSim::new("reconcile_unblocked");
        let agent = sim.db().create_agent("Mira", "").unwrap();
        assert!(!rearm(&sim.ctx, &agent.id).unwrap());
        assert!(sim.db().get_agent(&agent.id).unwrap().unwrap().block_status.is_none());
    }

    #[test]
    fn decision_requires_reason_to_reconcile() {
        assert_eq!(
            parse_decision(&json!({"reconcile": true, "reason": "I'm sorry"})).unwrap(),
            Some("I'm sorry".to_string())
        );
        assert_eq!(
            parse_decision(&json!({"reconcile": true, "reason": "  "})).unwrap(),
            None
        );
        assert_eq!(
            parse_decision(&json!({"reconcile": false, "reason": "no"})).unwrap(),
            None
        );
        assert!(matches!(
            parse_decision(&json!({"reason": "?"})),
            Err(CallError::Validation(_))
        ));
    }
}
