use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

impl ScheduleType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }
}

impl TryFrom<&str> for ScheduleType {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => anyhow::bail!(
                "Invalid schedule type '{other}'. Expected one of: 'cron', 'interval', 'once'"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Done,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Done => "done",
        }
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "done" => Ok(Self::Done),
            other => anyhow::bail!(
                "Invalid task status '{other}'. Expected one of: 'active', 'paused', 'done'"
            ),
        }
    }
}

/// A persisted scheduled prompt. The scheduler owns `status` and `next_run`.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub status: TaskStatus,
    pub next_run: DateTime<Utc>,
}

impl Store {
    pub fn add_task(
        &self,
        group_folder: &str,
        prompt: &str,
        schedule_type: ScheduleType,
        schedule_value: &str,
        next_run: DateTime<Utc>,
        max_tasks: usize,
    ) -> Result<Task> {
        let count = self.count_tasks()?;
        if count >= max_tasks {
            anyhow::bail!("Maximum number of scheduled tasks ({max_tasks}) reached");
        }

        let task = Task {
            id: Uuid::new_v4().to_string(),
            group_folder: group_folder.to_string(),
            prompt: prompt.to_string(),
            schedule_type,
            schedule_value: schedule_value.to_string(),
            status: TaskStatus::Active,
            next_run,
        };

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, group_folder, prompt, schedule_type, schedule_value, status, next_run)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    task.id,
                    task.group_folder,
                    task.prompt,
                    task.schedule_type.as_str(),
                    task.schedule_value,
                    task.status.as_str(),
                    task.next_run.to_rfc3339(),
                ],
            )
            .context("Failed to insert task")?;
            Ok(())
        })?;

        Ok(task)
    }

    pub fn count_tasks(&self) -> Result<usize> {
        self.with_conn(|conn| {
            let count: usize = conn.query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
            Ok(count)
        })
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.select_tasks("SELECT id, group_folder, prompt, schedule_type, schedule_value, status, next_run
                           FROM tasks ORDER BY next_run ASC", &[])
    }

    pub fn tasks_for_folder(&self, folder: &str) -> Result<Vec<Task>> {
        self.select_tasks(
            "SELECT id, group_folder, prompt, schedule_type, schedule_value, status, next_run
             FROM tasks WHERE group_folder = ?1 ORDER BY next_run ASC",
            &[folder],
        )
    }

    /// Active tasks whose `next_run` has elapsed.
    pub fn due_tasks(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        let now = now.to_rfc3339();
        self.select_tasks(
            "SELECT id, group_folder, prompt, schedule_type, schedule_value, status, next_run
             FROM tasks WHERE status = 'active' AND next_run <= ?1 ORDER BY next_run ASC",
            &[now.as_str()],
        )
    }

    /// Persist the scheduler's post-fire state. Written before dispatch so a
    /// crash between the write and the enqueue skips the fire instead of
    /// repeating it.
    pub fn update_task_after_dispatch(
        &self,
        id: &str,
        status: TaskStatus,
        next_run: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?1, next_run = ?2 WHERE id = ?3",
                    params![status.as_str(), next_run.to_rfc3339(), id],
                )
                .context("Failed to update task run state")?;
            if changed == 0 {
                anyhow::bail!("Task '{id}' not found");
            }
            Ok(())
        })
    }

    pub fn set_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    "UPDATE tasks SET status = ?1 WHERE id = ?2",
                    params![status.as_str(), id],
                )
                .context("Failed to update task status")?;
            if changed == 0 {
                anyhow::bail!("Task '{id}' not found");
            }
            Ok(())
        })
    }

    pub fn remove_task(&self, id: &str) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .context("Failed to delete task")?;
            if changed == 0 {
                anyhow::bail!("Task '{id}' not found");
            }
            Ok(())
        })
    }

    fn select_tasks(&self, sql: &str, bind: &[&str]) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(bind), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?;

            let mut tasks = Vec::new();
            for row in rows {
                let (id, group_folder, prompt, stype, svalue, status, next_run) = row?;
                tasks.push(Task {
                    id,
                    group_folder,
                    prompt,
                    schedule_type: ScheduleType::try_from(stype.as_str())?,
                    schedule_value: svalue,
                    status: TaskStatus::try_from(status.as_str())?,
                    next_run: parse_rfc3339(&next_run)?,
                });
            }
            Ok(tasks)
        })
    }
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in task table: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use tempfile::TempDir;

    fn open_store(tmp: &TempDir) -> Store {
        Store::open(&tmp.path().join("store/messages.db")).unwrap()
    }

    #[test]
    fn add_list_remove_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        let task = store
            .add_task("standup", "post the agenda", ScheduleType::Interval, "3600", Utc::now(), 10)
            .unwrap();

        let listed = store.list_tasks().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, task.id);
        assert_eq!(listed[0].schedule_type, ScheduleType::Interval);
        assert_eq!(listed[0].status, TaskStatus::Active);

        store.remove_task(&task.id).unwrap();
        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.remove_task(&task.id).is_err());
    }

    #[test]
    fn add_task_enforces_limit() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);

        store
            .add_task("a", "one", ScheduleType::Once, "2026-06-01T00:00:00Z", Utc::now(), 1)
            .unwrap();
        let err = store
            .add_task("a", "two", ScheduleType::Once, "2026-06-01T00:00:00Z", Utc::now(), 1)
            .unwrap_err();
        assert!(err.to_string().contains("Maximum number of scheduled tasks"));
    }

    #[test]
    fn due_tasks_filters_status_and_time() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let now = Utc::now();

        let due = store
            .add_task("a", "due", ScheduleType::Interval, "60", now - ChronoDuration::seconds(5), 10)
            .unwrap();
        store
            .add_task("a", "future", ScheduleType::Interval, "60", now + ChronoDuration::hours(1), 10)
            .unwrap();
        let paused = store
            .add_task("a", "paused", ScheduleType::Interval, "60", now - ChronoDuration::seconds(5), 10)
            .unwrap();
        store.set_task_status(&paused.id, TaskStatus::Paused).unwrap();

        let found = store.due_tasks(now).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, due.id);
    }

    #[test]
    fn update_after_dispatch_moves_next_run_and_status() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let now = Utc::now();

        let task = store
            .add_task("a", "once", ScheduleType::Once, "2026-06-01T00:00:00Z", now, 10)
            .unwrap();
        store
            .update_task_after_dispatch(&task.id, TaskStatus::Done, now)
            .unwrap();

        let listed = store.list_tasks().unwrap();
        assert_eq!(listed[0].status, TaskStatus::Done);
        assert!(store.due_tasks(now + ChronoDuration::hours(1)).unwrap().is_empty());
    }

    #[test]
    fn tasks_for_folder_filters() {
        let tmp = TempDir::new().unwrap();
        let store = open_store(&tmp);
        let now = Utc::now();

        store
            .add_task("a", "for a", ScheduleType::Interval, "60", now, 10)
            .unwrap();
        store
            .add_task("b", "for b", ScheduleType::Interval, "60", now, 10)
            .unwrap();

        let for_a = store.tasks_for_folder("a").unwrap();
        assert_eq!(for_a.len(), 1);
        assert_eq!(for_a[0].prompt, "for a");
    }
}
