use crate::config::Config;
use crate::store::tasks::TaskStatus;
use crate::store::Store;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::time::{self, Duration};

pub mod schedule;

/// Injected dispatch: `(jid, prompt)` lands on the group queue as a
/// synthetic prompt. The scheduler never touches channels or cursors.
pub type EnqueuePromptFn = Arc<dyn Fn(String, String) + Send + Sync>;

/// Periodically convert due tasks into synthetic prompts.
pub async fn run(config: Config, store: Store, enqueue: EnqueuePromptFn) -> Result<()> {
    let mut interval = time::interval(Duration::from_secs(effective_cadence(&config)));

    loop {
        interval.tick().await;
        if let Err(e) = tick(&store, &enqueue, Utc::now()) {
            tracing::warn!("Scheduler pass failed: {e:#}");
        }
    }
}

/// Wake at the router's cadence or faster, never slower, and never hot.
fn effective_cadence(config: &Config) -> u64 {
    let router_secs = config.router.poll_interval_secs.ceil() as u64;
    config.scheduler.poll_secs.min(router_secs.max(1)).max(1)
}

/// One scheduler pass. The task row is persisted before the prompt is
/// enqueued, so a crash in between skips the fire instead of repeating it.
fn tick(store: &Store, enqueue: &EnqueuePromptFn, now: DateTime<Utc>) -> Result<()> {
    let due = store.due_tasks(now)?;

    for task in due {
        let Some(group) = store.group_by_folder(&task.group_folder)? else {
            tracing::debug!(
                "Task {} targets unregistered folder {}, skipping",
                task.id,
                task.group_folder
            );
            continue;
        };

        let (status, next_run) =
            match schedule::next_run_after(task.schedule_type, &task.schedule_value, now) {
                Ok(Some(next)) => (TaskStatus::Active, next),
                Ok(None) => (TaskStatus::Done, task.next_run),
                Err(e) => {
                    tracing::warn!("Task {} has an invalid schedule, pausing: {e:#}", task.id);
                    store.set_task_status(&task.id, TaskStatus::Paused)?;
                    continue;
                }
            };

        store.update_task_after_dispatch(&task.id, status, next_run)?;
        enqueue(group.jid.clone(), task.prompt.clone());
    }

    Ok(())
}
