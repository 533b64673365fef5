use crate::config::Config;
use crate::queue::AgentProcess;
use crate::store::tasks::Task;
use crate::store::Chat;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

/// One parsed record from the agent's line-delimited stdout stream.
/// Unknown fields are ignored; a line that fails to parse is dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub status: RecordStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default, rename = "newSessionId")]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Success,
    Error,
    Progress,
}

impl OutputRecord {
    /// The user-visible candidate payload, if any. Non-string results are
    /// surfaced as their JSON rendering.
    pub fn result_text(&self) -> Option<String> {
        match &self.result {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    }
}

/// Terminal outcome of one agent run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Error {
        code: Option<i32>,
        stderr: String,
    },
}

/// Observer for streamed records, registered before the process starts and
/// called in arrival order.
#[async_trait]
pub trait StreamSink: Send {
    async fn on_record(&mut self, record: &OutputRecord);
}

#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub prompt: String,
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
}

// ── Workspace snapshots ───────────────────────────────────────────

/// `tasks.json` entry, written into the group workspace before each run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,
    #[serde(rename = "groupFolder")]
    pub group_folder: String,
    pub prompt: String,
    pub schedule_type: String,
    pub schedule_value: String,
    pub status: String,
    pub next_run: String,
}

impl From<&Task> for TaskSnapshot {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            group_folder: task.group_folder.clone(),
            prompt: task.prompt.clone(),
            schedule_type: task.schedule_type.as_str().to_string(),
            schedule_value: task.schedule_value.clone(),
            status: task.status.as_str().to_string(),
            next_run: task.next_run.to_rfc3339(),
        }
    }
}

/// `groups.json` entry: the roster of known group chats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub jid: String,
    pub name: Option<String>,
    #[serde(rename = "lastActivity")]
    pub last_activity: Option<String>,
    #[serde(rename = "isRegistered")]
    pub is_registered: bool,
}

impl GroupSnapshot {
    pub fn from_chat(chat: &Chat, is_registered: bool) -> Self {
        Self {
            jid: chat.jid.clone(),
            name: chat.name.clone(),
            last_activity: chat.last_message_time.clone(),
            is_registered,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceSnapshot {
    pub tasks: Vec<TaskSnapshot>,
    pub groups: Vec<GroupSnapshot>,
}

fn write_snapshots(workspace: &std::path::Path, snapshot: &WorkspaceSnapshot) -> Result<()> {
    std::fs::create_dir_all(workspace)
        .with_context(|| format!("Failed to create workspace: {}", workspace.display()))?;
    let tasks = serde_json::to_vec_pretty(&snapshot.tasks)?;
    std::fs::write(workspace.join("tasks.json"), tasks)
        .context("Failed to write tasks snapshot")?;
    let groups = serde_json::to_vec_pretty(&snapshot.groups)?;
    std::fs::write(workspace.join("groups.json"), groups)
        .context("Failed to write groups snapshot")?;
    Ok(())
}

fn container_name(group_folder: &str) -> String {
    let safe: String = group_folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix = Uuid::new_v4().simple().to_string();
    format!("clawbridge-{}-{}", safe, &suffix[..8])
}

// Idle timer park value once stdin has been closed; the timer fires at most
// once per run.
const IDLE_DISARMED: Duration = Duration::from_secs(365 * 24 * 3600);

/// Run one containerized agent to completion.
///
/// Writes the workspace snapshots, spawns the configured container command,
/// pipes the prompt in, surfaces each streamed record through `sink`, closes
/// stdin after `idle_timeout` of stream silence, and classifies the exit.
/// A non-zero exit after at least one delivered result still counts as
/// success so the cursor advance sticks and restart cannot re-deliver.
pub async fn run_agent(
    config: &Config,
    invocation: &AgentInvocation,
    snapshot: &WorkspaceSnapshot,
    on_register: impl FnOnce(Arc<AgentProcess>),
    sink: &mut dyn StreamSink,
) -> Result<RunStatus> {
    let workspace = config.resolve_group_folder(&invocation.group_folder)?;
    write_snapshots(&workspace, snapshot)?;

    let container = container_name(&invocation.group_folder);
    let workspace_str = workspace.to_string_lossy().to_string();

    let mut cmd = Command::new(&config.agent.program);
    for arg in &config.agent.args {
        cmd.arg(
            arg.replace("{container}", &container)
                .replace("{workspace}", &workspace_str),
        );
    }
    cmd.env("AGENT_GROUP_FOLDER", &invocation.group_folder)
        .env("AGENT_CHAT_JID", &invocation.chat_jid)
        .env("AGENT_IS_MAIN", if invocation.is_main { "1" } else { "0" })
        .env("AGENT_ASSISTANT_NAME", &config.assistant_name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(session) = &invocation.session_id {
        cmd.env("AGENT_SESSION_ID", session);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn agent via {}", config.agent.program))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("Agent process missing stdin pipe"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Agent process missing stdout pipe"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Agent process missing stderr pipe"))?;

    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut all = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if !all.is_empty() {
                all.push('\n');
            }
            all.push_str(&line);
        }
        all
    });

    let (process, mut kill_rx) = AgentProcess::new(
        stdin,
        container.clone(),
        invocation.group_folder.clone(),
    );

    // Prompt goes in before registration so piped batches cannot overtake it.
    process.write_line(&invocation.prompt).await?;
    on_register(Arc::clone(&process));

    let idle_timeout = Duration::from_secs(config.agent.idle_timeout_secs.max(1));
    let idle = tokio::time::sleep(idle_timeout);
    tokio::pin!(idle);

    let mut had_streaming_output = false;
    let mut out_lines = BufReader::new(stdout).lines();

    loop {
        tokio::select! {
            line = out_lines.next_line() => {
                match line.context("Failed to read agent stdout")? {
                    Some(raw) => {
                        let trimmed = raw.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        let record: OutputRecord = match serde_json::from_str(trimmed) {
                            Ok(record) => record,
                            Err(e) => {
                                tracing::warn!(
                                    "Dropping unparseable agent line from {container}: {e}"
                                );
                                continue;
                            }
                        };
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                        if record.result_text().is_some() {
                            had_streaming_output = true;
                        }
                        sink.on_record(&record).await;
                    }
                    None => break,
                }
            }
            () = &mut idle => {
                tracing::info!(
                    "Agent {container} idle for {}s, closing stdin",
                    idle_timeout.as_secs()
                );
                process.close_stdin().await;
                idle.as_mut().reset(Instant::now() + IDLE_DISARMED);
            }
            changed = kill_rx.changed() => {
                if changed.is_ok() && *kill_rx.borrow() {
                    tracing::warn!("Kill requested for agent {container}");
                    let _ = child.start_kill();
                }
            }
        }
    }

    // Stream is done; release stdin so the child is not held open by us.
    process.close_stdin().await;
    let status = child.wait().await.context("Failed to await agent exit")?;
    let stderr_text = stderr_task.await.unwrap_or_default();

    if status.success() || had_streaming_output {
        if !status.success() {
            tracing::warn!(
                "Agent {container} exited with {status} after streaming output, treating as success"
            );
        }
        Ok(RunStatus::Success)
    } else {
        Ok(RunStatus::Error {
            code: status.code(),
            stderr: stderr_text,
        })
    }
}
