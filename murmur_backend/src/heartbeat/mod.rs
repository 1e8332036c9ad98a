//! Heartbeat scheduler: a repeating tick that wakes a few agents and groups
//! at random, advances cooled-down blocks, and queues summarization.

pub mod reconcile;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::actions::{self, agent_key, group_key, WakeScope};
use crate::config::SimSettings;
use crate::context::{watch_background, SimContext};
use crate::gate::CallPriority;
use crate::model::{now_millis, Agent, BlockStatus, Timestamp};
use crate::summary;

pub const LAST_TICK_STATE_KEY: &str = "heartbeat_last_tick_at";

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub disabled: bool,
    pub agents_considered: usize,
    pub agents_sampled: usize,
    pub agents_woken: Vec<String>,
    pub reconciliations_started: Vec<String>,
    pub reflections_recovered: Vec<String>,
    pub groups_woken: Vec<String>,
    pub summaries_scheduled: Vec<String>,
}

pub struct Heartbeat {
    ctx: SimContext,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Heartbeat {
    pub fn new(ctx: SimContext) -> Self {
        Self {
            ctx,
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Arm the repeating timer. Returns false if it was already running.
    pub async fn start(&self) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        let period = Duration::from_secs(self.ctx.settings().await.tick_interval_secs.max(1));
        let ctx = self.ctx.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; wait a full period instead.
            interval.tick().await;
            let mut rng = StdRng::from_entropy();
            loop {
                interval.tick().await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = run_tick(&ctx, &running, &mut rng).await {
                    tracing::error!("Heartbeat tick failed: {:#}", e);
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            tracing::info!("Heartbeat stopped");
        });

        if let Some(previous) = self.lock_handle().replace(handle) {
            previous.abort();
        }
        tracing::info!("Heartbeat started, ticking every {:?}", period);
        true
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.lock_handle().take() {
            handle.abort();
        }
    }

    /// Run one tick now, outside the timer.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut rng = StdRng::from_entropy();
        self.tick_with_rng(&mut rng).await
    }

    pub async fn tick_with_rng<R: Rng + Send>(&self, rng: &mut R) -> Result<TickReport> {
        run_tick(&self.ctx, &self.running, rng).await
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_tick<R: Rng + Send>(
    ctx: &SimContext,
    running: &AtomicBool,
    rng: &mut R,
) -> Result<TickReport> {
    let settings = ctx.settings().await;
    let mut report = TickReport::default();

    if !settings.enable_background_activity {
        if running.swap(false, Ordering::SeqCst) {
            tracing::info!("Background activity disabled, heartbeat stopping");
        }
        report.disabled = true;
        return Ok(report);
    }

    let now = now_millis();

    let agents = ctx.db.list_agents()?;
    let stale_after = (settings.generation_timeout_secs as i64).saturating_mul(1_000);
    report.reflections_recovered = reconcile::recover_orphaned(ctx, &agents, stale_after, now);

    let mut pool: Vec<Agent> = agents
        .into_iter()
        .filter(|agent| {
            matches!(
                agent.block_status,
                None | Some(BlockStatus::BlockedByUser { .. })
            )
        })
        .filter(|agent| !ctx.gate.is_queued(&agent_key(&agent.id)))
        .collect();
    report.agents_considered = pool.len();
    pool.shuffle(rng);
    pool.truncate(settings.max_agents_per_tick);
    report.agents_sampled = pool.len();

    for agent in &pool {
        if let Err(e) = visit_agent(ctx, &settings, agent, now, rng, &mut report) {
            tracing::warn!("Heartbeat skipped {}: {:#}", agent.name, e);
        }
    }

    for group in ctx.db.list_groups()? {
        if !group.enable_offline_sim || group.members.is_empty() {
            continue;
        }
        if ctx.gate.is_queued(&group_key(&group.id)) {
            continue;
        }
        if !rng.gen_bool(settings.group_wake_probability) {
            continue;
        }
        let mut awake = Vec::new();
        for member in &group.members {
            match ctx.db.get_agent(member) {
                Ok(Some(agent)) if agent.block_status.is_none() => awake.push(agent.id),
                Ok(_) => {}
                Err(e) => tracing::warn!("Skipping member {} of {}: {:#}", member, group.name, e),
            }
        }
        let Some(member) = awake.choose(rng) else {
            continue;
        };
        let scope = WakeScope::Group {
            group_id: group.id.clone(),
        };
        let ticket = actions::wake(ctx, member, scope, CallPriority::Low);
        watch_background(format!("group wake:{}", group.id), ticket);
        report.groups_woken.push(group.id.clone());
    }

    report.summaries_scheduled = summary::dispatch(ctx, &settings, CallPriority::Low)?;
    ctx.db.set_state(LAST_TICK_STATE_KEY, &now.to_string())?;

    tracing::debug!(
        "Tick: {} sampled of {}, {} woken, {} groups, {} summaries",
        report.agents_sampled,
        report.agents_considered,
        report.agents_woken.len(),
        report.groups_woken.len(),
        report.summaries_scheduled.len()
    );
    Ok(report)
}

fn visit_agent<R: Rng>(
    ctx: &SimContext,
    settings: &SimSettings,
    agent: &Agent,
    now: Timestamp,
    rng: &mut R,
    report: &mut TickReport,
) -> Result<()> {
    if let Some(BlockStatus::BlockedByUser { since }) = &agent.block_status {
        if now.saturating_sub(*since) >= settings.cooldown_millis()
            && reconcile::begin(ctx, &agent.id, now)?
        {
            report.reconciliations_started.push(agent.id.clone());
        }
        return Ok(());
    }

    let reactive = ctx
        .db
        .last_message(&agent.id)?
        .is_some_and(|m| m.is_reactive_event());
    if reactive || rng.gen_bool(settings.private_wake_probability) {
        let ticket = actions::wake(ctx, &agent.id, WakeScope::Private, CallPriority::Low);
        watch_background(format!("wake:{}", agent.id), ticket);
        report.agents_woken.push(agent.id.clone());
    }
    Ok(())
}
