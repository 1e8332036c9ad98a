//! Incremental summarization.
//!
//! Each pass folds a conversation's unsummarized messages into topic threads.
//! Finished threads become [`SummaryRecord`]s, unfinished ones are cached on
//! the agent and re-offered to the next pass. Persisting records, writing the
//! cache and advancing `last_summary_action_count` commit together or not at
//! all, so a failed pass can simply be retried with the same input.

mod threads;

pub use threads::{normalize_voice, parse_threads, partition_threads, Partition};

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use uuid::Uuid;

use crate::config::SimSettings;
use crate::context::{watch_background, SimContext};
use crate::database::{insert_summary_on, load_agent_on, write_agent_state_on};
use crate::events::{SimEvent, SimEventKind};
use crate::gate::CallPriority;
use crate::generation::{GenerationRequest, Message};
use crate::model::{
    format_timestamp, Agent, ChatMessage, PendingSummary, SummaryRecord, Timestamp,
    USER_SENDER_ID,
};

pub fn summary_key(agent_id: &str) -> String {
    format!("summary:{}", agent_id)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub analyzed_messages: usize,
    pub records_written: usize,
    pub pending_threads: usize,
    pub last_summary_action_count: u64,
}

/// Pick the conversations that most need summarizing and queue them.
/// Returns the agent ids that were scheduled.
pub fn dispatch(
    ctx: &SimContext,
    settings: &SimSettings,
    priority: CallPriority,
) -> Result<Vec<String>> {
    let agents = ctx.db.list_agents()?;
    let mut candidates: Vec<&Agent> = agents
        .iter()
        .filter(|agent| is_due(agent, settings.summary_trigger_threshold))
        .filter(|agent| !ctx.gate.is_queued(&summary_key(&agent.id)))
        .collect();

    // Unfinished work first, then the largest backlog.
    candidates.sort_by(|a, b| {
        b.has_pending_summary()
            .cmp(&a.has_pending_summary())
            .then_with(|| b.summary_gap().cmp(&a.summary_gap()))
    });

    let mut scheduled = Vec::new();
    for agent in candidates.into_iter().take(settings.max_summaries_per_tick) {
        let key = summary_key(&agent.id);
        let task_ctx = ctx.clone();
        let agent_id = agent.id.clone();
        let ticket = ctx.gate.enqueue(priority, key.clone(), move || async move {
            run_pass(&task_ctx, &agent_id).await
        });
        tracing::debug!(
            "Scheduled summarization for {} (gap {}, pending {})",
            agent.name,
            agent.summary_gap(),
            agent.has_pending_summary()
        );
        watch_background(key, ticket);
        scheduled.push(agent.id.clone());
    }
    Ok(scheduled)
}

fn is_due(agent: &Agent, threshold: u64) -> bool {
    let gap = agent.summary_gap();
    gap >= threshold || (agent.has_pending_summary() && gap > 0)
}

/// Interactive path: jumps the queue and hands any failure back to the caller.
pub async fn summarize_now(ctx: &SimContext, agent_id: &str) -> Result<PassReport> {
    let task_ctx = ctx.clone();
    let id = agent_id.to_string();
    ctx.gate
        .enqueue(CallPriority::High, summary_key(agent_id), move || async move {
            run_pass(&task_ctx, &id).await
        })
        .await
}

/// One summarization pass over one conversation. This is the gated body; it
/// must only run inside a gate action.
pub async fn run_pass(ctx: &SimContext, agent_id: &str) -> Result<PassReport> {
    let agent = ctx
        .db
        .get_agent(agent_id)?
        .ok_or_else(|| anyhow!("agent '{}' not found", agent_id))?;
    let captured = agent.action_count;

    let last_summary_time = ctx.db.latest_summary_end(agent_id)?.unwrap_or(0);
    let messages = collect_messages(ctx, &agent, last_summary_time)?;

    if messages.is_empty() {
        let synced = ctx
            .db
            .update_agent(agent_id, |a| {
                a.pending_summary = None;
                a.last_summary_action_count = advance_counter(a, captured);
                a.last_summary_action_count
            })?
            .ok_or_else(|| anyhow!("agent '{}' disappeared mid-pass", agent_id))?;
        tracing::debug!("Nothing to summarize for {}, counter at {}", agent.name, synced);
        return Ok(PassReport {
            last_summary_action_count: synced,
            ..PassReport::default()
        });
    }

    let request = build_request(&agent, &messages);
    let response = ctx
        .generate_json(request)
        .await
        .with_context(|| format!("summarizing conversation with {}", agent.name))?;
    let threads = parse_threads(&response)?;

    let analyzed: HashSet<Timestamp> = messages.iter().map(|m| m.timestamp).collect();
    let analyzed_up_to = messages
        .iter()
        .map(|m| m.timestamp)
        .max()
        .unwrap_or(last_summary_time);
    let partition = partition_threads(threads, &analyzed);

    let records: Vec<SummaryRecord> = partition
        .complete
        .iter()
        .filter_map(|thread| {
            let (start_time, end_time) = thread.time_range()?;
            Some(SummaryRecord {
                id: Uuid::new_v4().to_string(),
                conversation_id: agent.id.clone(),
                content: normalize_voice(&thread.topic_summary, &agent.name),
                keywords: thread.keywords.clone(),
                start_time,
                end_time,
                priority: thread.priority,
                enabled: true,
            })
        })
        .collect();

    let pending = (!partition.incomplete.is_empty()).then(|| PendingSummary {
        threads: partition.incomplete.clone(),
        analyzed_up_to,
    });
    let pending_threads = partition.incomplete.len();

    let counter = ctx.db.transaction(|tx| {
        for record in &records {
            insert_summary_on(tx, record)?;
        }
        let mut current = load_agent_on(tx, agent_id)?
            .ok_or_else(|| anyhow!("agent '{}' disappeared mid-pass", agent_id))?;
        current.pending_summary = pending;
        current.last_summary_action_count = advance_counter(&current, captured);
        write_agent_state_on(tx, &current)?;
        Ok(current.last_summary_action_count)
    })?;

    let mut events: Vec<SimEvent> = records
        .iter()
        .map(|record| SimEvent::new(SimEventKind::SummaryCreated, record.id.clone()))
        .collect();
    events.push(SimEvent::new(SimEventKind::AgentUpdated, agent.id.clone()));
    ctx.notifier.notify_all(events);

    tracing::info!(
        "Summarized {} messages for {}: {} record(s), {} pending thread(s)",
        messages.len(),
        agent.name,
        records.len(),
        pending_threads
    );

    Ok(PassReport {
        analyzed_messages: messages.len(),
        records_written: records.len(),
        pending_threads,
        last_summary_action_count: counter,
    })
}

/// Never move backwards, never pass the live counter.
fn advance_counter(current: &Agent, captured: u64) -> u64 {
    current
        .last_summary_action_count
        .max(captured)
        .min(current.action_count)
}

fn collect_messages(
    ctx: &SimContext,
    agent: &Agent,
    last_summary_time: Timestamp,
) -> Result<Vec<ChatMessage>> {
    let mut by_timestamp: BTreeMap<Timestamp, ChatMessage> = BTreeMap::new();

    for message in ctx.db.messages_after(&agent.id, last_summary_time)? {
        if message.is_summarizable() {
            by_timestamp.insert(message.timestamp, message);
        }
    }

    if let Some(pending) = &agent.pending_summary {
        let referenced: Vec<Timestamp> = pending
            .threads
            .iter()
            .flat_map(|thread| thread.message_timestamps.iter().copied())
            .filter(|ts| !by_timestamp.contains_key(ts))
            .collect();
        for message in ctx.db.messages_at(&agent.id, &referenced)? {
            if message.is_summarizable() {
                by_timestamp.insert(message.timestamp, message);
            }
        }
    }

    Ok(by_timestamp.into_values().collect())
}

fn build_request(agent: &Agent, messages: &[ChatMessage]) -> GenerationRequest {
    let mut prompt = format!(
        "You keep the long-term memory of {name}. {persona}\n\n\
         Split the conversation below into topic threads. Write each topic_summary \
         in third person from {name}'s point of view. Reference messages only by \
         the numeric timestamps shown in brackets. Mark a thread \"ongoing\": true \
         if the topic is clearly unfinished.\n\n\
         Respond with JSON only:\n\
         {{\"threads\": [{{\"topic_summary\": \"...\", \"keywords\": [\"...\"], \
         \"message_timestamps\": [123], \"ongoing\": false, \"priority\": 0}}]}}",
        name = agent.name,
        persona = agent.persona.trim(),
    );

    if let Some(pending) = &agent.pending_summary {
        if !pending.threads.is_empty() {
            prompt.push_str("\n\nThreads left open last time (extend them if they continue):");
            for thread in &pending.threads {
                prompt.push_str(&format!("\n- {}", thread.topic_summary));
            }
        }
    }

    let transcript = messages
        .iter()
        .map(|message| {
            let speaker = if message.sender_id == USER_SENDER_ID {
                "User"
            } else if message.sender_id == agent.id {
                agent.name.as_str()
            } else {
                message.sender_id.as_str()
            };
            format!(
                "[{}] ({}) {}: {}",
                message.timestamp,
                format_timestamp(message.timestamp),
                speaker,
                message.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    GenerationRequest::json(prompt, vec![Message::user(transcript)])
}
