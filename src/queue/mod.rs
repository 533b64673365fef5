use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

/// One unit of agent-producing work for a group.
#[derive(Debug, Clone)]
pub enum WorkItem {
    /// Query the store for pending messages and run the agent over them.
    Check,
    /// Run the agent with this literal prompt (scheduler path).
    Prompt(String),
}

type ProcessFuture = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Injected work function: `(jid, synthetic_prompt)`. Returning `false`
/// means the unit failed with a cursor rollback; the queue must not retry,
/// the router re-enqueues on its next poll.
pub type ProcessFn = Arc<dyn Fn(String, Option<String>) -> ProcessFuture + Send + Sync>;

/// Handle to a live agent process, registered by the runner so the queue can
/// pipe further input into it.
pub struct AgentProcess {
    pub container_name: String,
    pub group_folder: String,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    kill_tx: watch::Sender<bool>,
}

impl AgentProcess {
    pub fn new(
        stdin: ChildStdin,
        container_name: String,
        group_folder: String,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (kill_tx, kill_rx) = watch::channel(false);
        (
            Arc::new(Self {
                container_name,
                group_folder,
                stdin: tokio::sync::Mutex::new(Some(stdin)),
                kill_tx,
            }),
            kill_rx,
        )
    }

    /// Write one line-framed block to the agent's stdin.
    pub async fn write_line(&self, text: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            anyhow::bail!("agent stdin is closed");
        };
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Drop the stdin handle, signalling EOF to the agent.
    pub async fn close_stdin(&self) {
        let mut guard = self.stdin.lock().await;
        *guard = None;
    }

    pub fn request_kill(&self) {
        let _ = self.kill_tx.send(true);
    }
}

#[derive(Default)]
struct GroupState {
    queued: VecDeque<WorkItem>,
    active: Option<Arc<AgentProcess>>,
    idle_notified: bool,
    draining: bool,
}

/// Per-group FIFO of work items, bound to at most one live agent process per
/// group. Independent groups drain concurrently; within a group, work is
/// strictly serialized.
pub struct GroupQueue {
    groups: Mutex<HashMap<String, GroupState>>,
    process_fn: Mutex<Option<ProcessFn>>,
    accepting: AtomicBool,
    /// Self-reference for spawning drain tasks from `&self` methods.
    weak: Weak<GroupQueue>,
}

impl GroupQueue {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            groups: Mutex::new(HashMap::new()),
            process_fn: Mutex::new(None),
            accepting: AtomicBool::new(true),
            weak: weak.clone(),
        })
    }

    /// Late-bound work function; breaks the router/queue/runner cycle.
    pub fn set_process_fn(&self, f: ProcessFn) {
        *self.process_fn.lock() = Some(f);
    }

    /// Pipe a formatted batch into the group's live agent. Returns false when
    /// no agent is running or its stdin has already been closed, in which
    /// case the caller should enqueue a check instead.
    pub async fn send_message(&self, jid: &str, text: &str) -> bool {
        let active = {
            let groups = self.groups.lock();
            groups.get(jid).and_then(|g| g.active.clone())
        };
        let Some(process) = active else {
            return false;
        };
        match process.write_line(text).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Pipe to agent for {jid} failed, will respawn: {e:#}");
                false
            }
        }
    }

    pub fn enqueue_message_check(&self, jid: &str) {
        self.enqueue(jid, WorkItem::Check);
    }

    pub fn enqueue_prompt(&self, jid: &str, prompt: String) {
        self.enqueue(jid, WorkItem::Prompt(prompt));
    }

    fn enqueue(&self, jid: &str, item: WorkItem) {
        if !self.accepting.load(Ordering::SeqCst) {
            tracing::warn!("Queue is shutting down, dropping work for {jid}");
            return;
        }
        let spawn_drain = {
            let mut groups = self.groups.lock();
            let state = groups.entry(jid.to_string()).or_default();
            state.queued.push_back(item);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };
        if spawn_drain {
            let Some(queue) = self.weak.upgrade() else {
                return;
            };
            let jid = jid.to_string();
            tokio::spawn(async move {
                queue.drain(jid).await;
            });
        }
    }

    async fn drain(self: Arc<Self>, jid: String) {
        loop {
            let item = {
                let mut groups = self.groups.lock();
                let state = groups.entry(jid.clone()).or_default();
                if !self.accepting.load(Ordering::SeqCst) {
                    state.queued.clear();
                    state.draining = false;
                    return;
                }
                match state.queued.pop_front() {
                    Some(item) => item,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };

            let Some(process_fn) = self.process_fn.lock().clone() else {
                tracing::error!("No process function installed, dropping work for {jid}");
                continue;
            };
            let prompt = match item {
                WorkItem::Check => None,
                WorkItem::Prompt(p) => Some(p),
            };
            // A false return means the cursor was rolled back. The work is
            // not retried here; the router re-observes and re-enqueues.
            let _ok = process_fn(jid.clone(), prompt).await;
        }
    }

    /// Arm the idle latch: the agent signalled it is ready for more input, so
    /// the next batch should be piped rather than spawning a new process.
    pub fn notify_idle(&self, jid: &str) {
        let mut groups = self.groups.lock();
        if let Some(state) = groups.get_mut(jid) {
            state.idle_notified = true;
        }
    }

    pub fn register_process(&self, jid: &str, process: Arc<AgentProcess>) {
        let mut groups = self.groups.lock();
        let state = groups.entry(jid.to_string()).or_default();
        state.active = Some(process);
        state.idle_notified = false;
    }

    pub fn clear_process(&self, jid: &str) {
        let mut groups = self.groups.lock();
        if let Some(state) = groups.get_mut(jid) {
            state.active = None;
            state.idle_notified = false;
        }
    }

    pub fn has_active(&self, jid: &str) -> bool {
        self.groups
            .lock()
            .get(jid)
            .is_some_and(|g| g.active.is_some())
    }

    /// Close the active agent's stdin (idle-timeout path).
    pub async fn close_stdin(&self, jid: &str) {
        let active = {
            let groups = self.groups.lock();
            groups.get(jid).and_then(|g| g.active.clone())
        };
        if let Some(process) = active {
            process.close_stdin().await;
        }
    }

    fn active_processes(&self) -> Vec<Arc<AgentProcess>> {
        self.groups
            .lock()
            .values()
            .filter_map(|g| g.active.clone())
            .collect()
    }

    fn any_active(&self) -> bool {
        self.groups.lock().values().any(|g| g.active.is_some())
    }

    /// Stop intake, signal stdin-close to every live agent, wait up to
    /// `grace` for them to finish, then kill whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        self.accepting.store(false, Ordering::SeqCst);

        for process in self.active_processes() {
            process.close_stdin().await;
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.any_active() {
                return;
            }
            sleep(Duration::from_millis(100)).await;
        }

        for process in self.active_processes() {
            tracing::warn!(
                "Killing agent {} after shutdown grace expired",
                process.container_name
            );
            process.request_kill();
        }
    }
}
