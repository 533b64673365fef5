use crate::agent::{
    self, AgentInvocation, GroupSnapshot, OutputRecord, RecordStatus, RunStatus, StreamSink,
    TaskSnapshot, WorkspaceSnapshot,
};
use crate::channels::ChannelRegistry;
use crate::config::Config;
use crate::queue::GroupQueue;
use crate::store::{agent_cursor_key, Message, RegisteredGroup, Store, LAST_TIMESTAMP_KEY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Duration;

pub mod format;

/// Mutable router state. Every mutator performs one persisted write; there
/// are no ambient globals and no suspension points inside a cursor update.
struct RouterState {
    /// Global observation watermark over all registered groups.
    last_timestamp: String,
    /// Per-JID delivery cursors. The exactly-once anchor.
    agent_cursors: HashMap<String, String>,
    /// Cache of the registered-groups table, refreshed each poll.
    groups: HashMap<String, RegisteredGroup>,
    /// Groups whose cursor was rolled back. The watermark has already moved
    /// past their rows, so the next poll re-enqueues them from here.
    retry_jids: HashSet<String>,
}

/// Drives progress: polls the store, claims batches, and dispatches them
/// into agents through the group queue.
pub struct Router {
    config: Config,
    store: Store,
    queue: Arc<GroupQueue>,
    channels: Arc<ChannelRegistry>,
    state: Mutex<RouterState>,
    trigger: Option<Regex>,
    /// Per-JID guard serializing cursor-read, delivery, cursor-advance. The
    /// pipe path and the dispatch claim would otherwise race on the same
    /// rows and hand them to the agent twice.
    delivery_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Router {
    pub fn new(
        config: Config,
        store: Store,
        queue: Arc<GroupQueue>,
        channels: Arc<ChannelRegistry>,
    ) -> Result<Arc<Self>> {
        let trigger = match &config.trigger_pattern {
            Some(pattern) => Some(
                Regex::new(pattern)
                    .with_context(|| format!("Invalid TRIGGER_PATTERN: {pattern}"))?,
            ),
            None => None,
        };

        let last_timestamp = store.state_get(LAST_TIMESTAMP_KEY)?.unwrap_or_default();
        let agent_cursors = store.agent_cursors()?.into_iter().collect();
        let groups = store
            .registered_groups()?
            .into_iter()
            .map(|g| (g.jid.clone(), g))
            .collect();

        let router = Arc::new(Self {
            config,
            store,
            queue,
            channels,
            state: Mutex::new(RouterState {
                last_timestamp,
                agent_cursors,
                groups,
                retry_jids: HashSet::new(),
            }),
            trigger,
            delivery_locks: Mutex::new(HashMap::new()),
        });

        // Hand the queue its work function. Late binding through a weak
        // reference breaks the router/queue/runner dependency cycle.
        let weak = Arc::downgrade(&router);
        router.queue.set_process_fn(Arc::new(move |jid, prompt| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(router) => router.process_group(&jid, prompt).await,
                    None => true,
                }
            })
        }));

        Ok(router)
    }

    /// The message loop. Individual poll failures are logged and retried on
    /// the next tick; only a panic stops the loop.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let poll = Duration::from_secs_f64(self.config.router.poll_interval_secs);
        loop {
            if let Err(e) = self.poll_once().await {
                tracing::warn!("Message poll failed: {e:#}");
            }
            if poll.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(poll).await;
            }
        }
    }

    /// One poll: observe new rows, persist the watermark, then deliver per
    /// group, either by piping into a live agent or by enqueueing a check.
    pub async fn poll_once(&self) -> Result<()> {
        self.reload_groups()?;

        // Rolled-back groups first: their rows are behind the watermark and
        // would otherwise wait for fresh traffic.
        let retries: Vec<String> = self.state.lock().retry_jids.drain().collect();
        for jid in retries {
            self.queue.enqueue_message_check(&jid);
        }

        let (jids, last_ts) = {
            let state = self.state.lock();
            (
                state.groups.keys().cloned().collect::<Vec<_>>(),
                state.last_timestamp.clone(),
            )
        };
        if jids.is_empty() {
            return Ok(());
        }

        let (messages, newest) =
            self.store
                .get_new_messages(&jids, &last_ts, &self.config.assistant_name)?;
        if messages.is_empty() {
            return Ok(());
        }
        // Observation cursor first: a crash past this point must not
        // re-observe, recovery rescans per JID instead.
        if let Some(newest) = &newest {
            self.advance_last_timestamp(newest)?;
        }

        let mut batches: BTreeMap<String, Vec<Message>> = BTreeMap::new();
        for msg in messages {
            batches.entry(msg.chat_jid.clone()).or_default().push(msg);
        }

        for (jid, batch) in batches {
            if let Some(re) = &self.trigger {
                if !batch.iter().any(|m| re.is_match(&m.content)) {
                    tracing::debug!("No trigger match for {jid}, holding batch as context");
                    continue;
                }
            }

            let lock = self.delivery_lock(&jid);
            let _guard = lock.lock().await;

            let cursor = self.agent_cursor(&jid);
            let pending =
                self.store
                    .get_messages_since(&jid, &cursor, &self.config.assistant_name)?;
            let Some(last) = pending.last() else {
                continue;
            };
            let last_ts = last.timestamp.clone();

            let formatted = format::format_messages(&pending);
            if self.queue.send_message(&jid, &formatted).await {
                // The live agent owns these rows now.
                self.advance_agent_cursor(&jid, &last_ts)?;
                self.channels.set_typing(&jid, true).await;
            } else {
                self.queue.enqueue_message_check(&jid);
            }
        }

        Ok(())
    }

    /// Close the crash window between watermark advance and delivery: any
    /// group whose delivery cursor trails its stored messages gets a check.
    pub fn recover_pending(&self) -> Result<()> {
        self.reload_groups()?;
        let jids: Vec<String> = self.state.lock().groups.keys().cloned().collect();

        for jid in jids {
            let cursor = self.agent_cursor(&jid);
            let pending =
                self.store
                    .get_messages_since(&jid, &cursor, &self.config.assistant_name)?;
            if !pending.is_empty() {
                tracing::info!("Recovered {} pending message(s) for {jid}", pending.len());
                self.queue.enqueue_message_check(&jid);
            }
        }
        Ok(())
    }

    /// One unit of queue work. `synthetic` carries a scheduler prompt; user
    /// batches are read from the store. Returns false only when the unit
    /// failed and the cursor was rolled back.
    pub async fn process_group(&self, jid: &str, synthetic: Option<String>) -> bool {
        match self.dispatch(jid, synthetic).await {
            Ok(ok) => ok,
            Err(e) => {
                tracing::error!("Dispatch for {jid} failed: {e:#}");
                false
            }
        }
    }

    async fn dispatch(&self, jid: &str, synthetic: Option<String>) -> Result<bool> {
        let Some(group) = self.group_for(jid) else {
            tracing::debug!("Dropping work for unregistered JID {jid}");
            return Ok(true);
        };
        let is_main = group.folder == self.config.main_group_folder;

        // Claim-before-run. Observed messages belong to this run before any
        // side effect, so a crash leaves them claimed rather than unclaimed,
        // and the explicit rollback below is the only way back.
        let (prompt, claim) = match synthetic {
            Some(prompt) => (prompt, None),
            None => {
                let lock = self.delivery_lock(jid);
                let _guard = lock.lock().await;

                let previous = self.agent_cursor(jid);
                let pending =
                    self.store
                        .get_messages_since(jid, &previous, &self.config.assistant_name)?;
                let Some(last) = pending.last() else {
                    return Ok(true);
                };
                let last_ts = last.timestamp.clone();
                self.advance_agent_cursor(jid, &last_ts)?;
                (format::format_messages(&pending), Some(previous))
            }
        };

        let session_id = self.store.session_for(&group.folder).unwrap_or_else(|e| {
            tracing::warn!("Session lookup for {} failed: {e:#}", group.folder);
            None
        });
        let snapshot = self.build_snapshot(&group, is_main).unwrap_or_else(|e| {
            tracing::warn!("Snapshot build for {} failed: {e:#}", group.folder);
            WorkspaceSnapshot::default()
        });

        let invocation = AgentInvocation {
            prompt,
            session_id,
            group_folder: group.folder.clone(),
            chat_jid: jid.to_string(),
            is_main,
        };

        self.channels.set_typing(jid, true).await;

        let mut sink = DispatchSink {
            store: self.store.clone(),
            channels: Arc::clone(&self.channels),
            queue: Arc::clone(&self.queue),
            assistant_name: self.config.assistant_name.clone(),
            jid: jid.to_string(),
            group_folder: group.folder.clone(),
            group_name: group.name.clone(),
            had_error: false,
            output_sent: false,
        };

        let register_queue = Arc::clone(&self.queue);
        let register_jid = jid.to_string();
        let result = agent::run_agent(
            &self.config,
            &invocation,
            &snapshot,
            move |process| register_queue.register_process(&register_jid, process),
            &mut sink,
        )
        .await;

        self.queue.clear_process(jid);
        self.channels.set_typing(jid, false).await;

        match result {
            Ok(RunStatus::Success) => {
                if sink.had_error {
                    tracing::warn!(
                        "Agent for group {} streamed an error but finished cleanly",
                        group.name
                    );
                }
                Ok(true)
            }
            Ok(RunStatus::Error { code, stderr }) => {
                if sink.output_sent {
                    // The user saw something. A retry would duplicate it.
                    tracing::warn!(
                        "Agent for group {} failed (code {code:?}) after delivering output, \
                         keeping cursor: {stderr}",
                        group.name
                    );
                    Ok(true)
                } else if let Some(previous) = claim {
                    tracing::warn!(
                        "Agent for group {} failed silently (code {code:?}), rolling cursor \
                         back: {stderr}",
                        group.name
                    );
                    self.state.lock().retry_jids.insert(jid.to_string());
                    self.set_agent_cursor(jid, &previous)?;
                    Ok(false)
                } else {
                    // Synthetic prompts are at-most-once by design.
                    tracing::warn!(
                        "Scheduled run for group {} failed (code {code:?}): {stderr}",
                        group.name
                    );
                    Ok(true)
                }
            }
            Err(e) => {
                if !sink.output_sent {
                    if let Some(previous) = claim {
                        self.state.lock().retry_jids.insert(jid.to_string());
                        self.set_agent_cursor(jid, &previous)?;
                        tracing::error!(
                            "Agent run for group {} errored, rolling cursor back: {e:#}",
                            group.name
                        );
                        return Ok(false);
                    }
                }
                tracing::error!("Agent run for group {} errored: {e:#}", group.name);
                Ok(true)
            }
        }
    }

    // ── Snapshot assembly ─────────────────────────────────────────

    /// The main group sees every task and the full roster; other groups see
    /// only their own slice.
    fn build_snapshot(&self, group: &RegisteredGroup, is_main: bool) -> Result<WorkspaceSnapshot> {
        let tasks = if is_main {
            self.store.list_tasks()?
        } else {
            self.store.tasks_for_folder(&group.folder)?
        };

        let registered: HashMap<String, RegisteredGroup> = {
            let state = self.state.lock();
            state.groups.clone()
        };

        let mut groups = Vec::new();
        let chats = self.store.group_chats()?;
        for chat in &chats {
            if !is_main && chat.jid != group.jid {
                continue;
            }
            groups.push(GroupSnapshot::from_chat(
                chat,
                registered.contains_key(&chat.jid),
            ));
        }
        // Registered groups without chat rows yet still belong on the roster.
        for (jid, reg) in &registered {
            if !is_main && *jid != group.jid {
                continue;
            }
            if !chats.iter().any(|c| &c.jid == jid) {
                groups.push(GroupSnapshot {
                    jid: jid.clone(),
                    name: Some(reg.name.clone()),
                    last_activity: None,
                    is_registered: true,
                });
            }
        }

        Ok(WorkspaceSnapshot {
            tasks: tasks.iter().map(TaskSnapshot::from).collect(),
            groups,
        })
    }

    // ── State mutators (one persisted write each) ─────────────────

    fn reload_groups(&self) -> Result<()> {
        let groups: HashMap<String, RegisteredGroup> = self
            .store
            .registered_groups()?
            .into_iter()
            .map(|g| (g.jid.clone(), g))
            .collect();
        self.state.lock().groups = groups;
        Ok(())
    }

    fn group_for(&self, jid: &str) -> Option<RegisteredGroup> {
        self.state.lock().groups.get(jid).cloned()
    }

    fn delivery_lock(&self, jid: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.delivery_locks.lock();
        Arc::clone(locks.entry(jid.to_string()).or_default())
    }

    pub fn agent_cursor(&self, jid: &str) -> String {
        self.state
            .lock()
            .agent_cursors
            .get(jid)
            .cloned()
            .unwrap_or_default()
    }

    fn advance_last_timestamp(&self, ts: &str) -> Result<()> {
        let mut state = self.state.lock();
        if ts <= state.last_timestamp.as_str() {
            return Ok(());
        }
        state.last_timestamp = ts.to_string();
        self.store.state_set(LAST_TIMESTAMP_KEY, ts)
    }

    fn advance_agent_cursor(&self, jid: &str, ts: &str) -> Result<()> {
        self.set_agent_cursor(jid, ts)
    }

    /// Raw cursor write, also the single rollback path: terminal agent
    /// failure with no user-visible output restores the pre-claim cursor.
    fn set_agent_cursor(&self, jid: &str, ts: &str) -> Result<()> {
        let mut state = self.state.lock();
        state
            .agent_cursors
            .insert(jid.to_string(), ts.to_string());
        self.store.state_set(&agent_cursor_key(jid), ts)
    }
}

/// Per-run stream observer: persists sessions, filters and forwards output,
/// arms the idle latch, and tracks what the user actually saw.
struct DispatchSink {
    store: Store,
    channels: Arc<ChannelRegistry>,
    queue: Arc<GroupQueue>,
    assistant_name: String,
    jid: String,
    group_folder: String,
    group_name: String,
    had_error: bool,
    output_sent: bool,
}

#[async_trait]
impl StreamSink for DispatchSink {
    async fn on_record(&mut self, record: &OutputRecord) {
        if let Some(session) = &record.new_session_id {
            if let Err(e) = self.store.set_session(&self.group_folder, session) {
                tracing::warn!("Failed to persist session for {}: {e:#}", self.group_folder);
            }
        }

        if let Some(text) = record.result_text() {
            let visible = format::strip_internal(&text);
            if !visible.is_empty() {
                match self.channels.send_message(&self.jid, &visible).await {
                    Ok(()) => {
                        self.output_sent = true;
                        if let Err(e) =
                            self.store
                                .record_outgoing(&self.jid, &visible, &self.assistant_name)
                        {
                            tracing::debug!("Failed to record outgoing message: {e:#}");
                        }
                    }
                    Err(e) => {
                        // Partial delivery is tolerated; the run continues.
                        tracing::warn!("Send to {} failed: {e:#}", self.jid);
                    }
                }
            }
        }

        match record.status {
            RecordStatus::Success => self.queue.notify_idle(&self.jid),
            RecordStatus::Error => {
                self.had_error = true;
                if let Some(err) = &record.error {
                    tracing::warn!("Agent error record for group {}: {err}", self.group_name);
                }
            }
            RecordStatus::Progress => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channel;
    use crate::config::AgentConfig;
    use crate::store::test_support::user_message;
    use crate::store::now_rfc3339;
    use tempfile::TempDir;
    use tokio::time::sleep;

    struct RecordingChannel {
        sent: Mutex<Vec<(String, String)>>,
        typing: Mutex<Vec<(String, bool)>>,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                typing: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        fn owns_jid(&self, _jid: &str) -> bool {
            true
        }

        async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().push((jid.to_string(), text.to_string()));
            Ok(())
        }

        async fn set_typing(&self, jid: &str, typing: bool) -> anyhow::Result<()> {
            self.typing.lock().push((jid.to_string(), typing));
            Ok(())
        }
    }

    struct Fixture {
        config: Config,
        store: Store,
        queue: Arc<GroupQueue>,
        channel: Arc<RecordingChannel>,
        router: Arc<Router>,
        _tmp: TempDir,
    }

    fn fixture_with(agent_script: &str, trigger: Option<&str>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let config = Config {
            home_dir: tmp.path().to_path_buf(),
            trigger_pattern: trigger.map(str::to_string),
            agent: AgentConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), agent_script.to_string()],
                idle_timeout_secs: 30,
            },
            ..Config::default()
        };
        let store = Store::open(&config.db_path()).unwrap();
        let queue = GroupQueue::new();
        let channel = RecordingChannel::new();
        let registry = Arc::new(ChannelRegistry::new(vec![channel.clone() as Arc<dyn Channel>]));
        let router = Router::new(config.clone(), store.clone(), queue.clone(), registry).unwrap();
        Fixture {
            config,
            store,
            queue,
            channel,
            router,
            _tmp: tmp,
        }
    }

    fn fixture(agent_script: &str) -> Fixture {
        fixture_with(agent_script, None)
    }

    fn register_group(store: &Store, jid: &str, folder: &str) {
        store
            .register_group(&RegisteredGroup {
                jid: jid.to_string(),
                name: folder.to_string(),
                folder: folder.to_string(),
                trigger: None,
                added_at: now_rfc3339(),
            })
            .unwrap();
    }

    async fn wait_until<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached within timeout");
    }

    const HAPPY_AGENT: &str = r#"read -r line
printf '%s\n' '{"status":"success","result":"hello","newSessionId":"sess-1"}'"#;

    const SILENT_FAILURE_AGENT: &str = r#"read -r line
exit 1"#;

    #[tokio::test]
    async fn no_pending_work_is_a_clean_true() {
        let f = fixture(HAPPY_AGENT);
        register_group(&f.store, "tg:100", "standup");

        assert!(f.router.process_group("tg:100", None).await);
        assert_eq!(f.router.agent_cursor("tg:100"), "");
        assert!(f.channel.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn happy_path_delivers_and_advances_cursor() {
        let f = fixture(HAPPY_AGENT);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"))
            .unwrap();
        f.store
            .insert_message(&user_message(
                "m2",
                "tg:100",
                "how are you",
                "2026-01-01T00:00:02.000Z",
            ))
            .unwrap();

        f.router.poll_once().await.unwrap();
        wait_until(|| !f.channel.sent.lock().is_empty()).await;
        wait_until(|| !f.queue.has_active("tg:100")).await;

        let sent = f.channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], ("tg:100".to_string(), "hello".to_string()));
        drop(sent);

        assert_eq!(f.router.agent_cursor("tg:100"), "2026-01-01T00:00:02.000Z");
        assert_eq!(
            f.store.session_for("standup").unwrap().as_deref(),
            Some("sess-1")
        );
        assert_eq!(
            f.store.state_get(LAST_TIMESTAMP_KEY).unwrap().as_deref(),
            Some("2026-01-01T00:00:02.000Z")
        );
    }

    #[tokio::test]
    async fn silent_failure_rolls_the_cursor_back() {
        let f = fixture(SILENT_FAILURE_AGENT);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"))
            .unwrap();

        let ok = f.router.process_group("tg:100", None).await;
        assert!(!ok);
        assert!(f.channel.sent.lock().is_empty());
        assert_eq!(f.router.agent_cursor("tg:100"), "");
        // And the persisted cursor matches the rollback.
        assert_eq!(
            f.store
                .state_get(&agent_cursor_key("tg:100"))
                .unwrap()
                .as_deref(),
            Some("")
        );
    }

    #[tokio::test]
    async fn failure_after_output_keeps_the_cursor() {
        let script = r#"read -r line
printf '%s\n' '{"status":"success","result":"partial"}'
exit 137"#;
        let f = fixture(script);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:02.000Z"))
            .unwrap();

        let ok = f.router.process_group("tg:100", None).await;
        assert!(ok);
        assert_eq!(f.channel.sent.lock()[0].1, "partial");
        assert_eq!(f.router.agent_cursor("tg:100"), "2026-01-01T00:00:02.000Z");
    }

    #[tokio::test]
    async fn internal_blocks_never_reach_the_channel() {
        let script = r#"read -r line
printf '%s\n' '{"status":"success","result":"<internal>scratch</internal>"}'
printf '%s\n' '{"status":"success","result":"<internal>notes</internal>visible"}'"#;
        let f = fixture(script);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"))
            .unwrap();

        assert!(f.router.process_group("tg:100", None).await);
        let sent = f.channel.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "visible");
    }

    #[tokio::test]
    async fn bot_rows_are_never_pending_work() {
        let f = fixture(HAPPY_AGENT);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .record_outgoing("tg:100", "own reply", "Claw")
            .unwrap();

        assert!(f.router.process_group("tg:100", None).await);
        assert!(f.channel.sent.lock().is_empty());
        assert_eq!(f.router.agent_cursor("tg:100"), "");
    }

    #[tokio::test]
    async fn poll_pipes_into_live_agent_instead_of_respawning() {
        // First batch starts an agent that stays alive reading stdin; the
        // second batch must be piped, not spawn a second process.
        let script = r#"read -r line
printf '%s\n' '{"status":"success","result":"first reply"}'
while read -r line; do
  case "$line" in
    *wait*) printf '%s\n' '{"status":"success","result":"piped reply"}'; exit 0 ;;
  esac
done"#;
        let f = fixture(script);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"))
            .unwrap();

        f.router.poll_once().await.unwrap();
        wait_until(|| f.queue.has_active("tg:100")).await;
        wait_until(|| !f.channel.sent.lock().is_empty()).await;

        f.store
            .insert_message(&user_message("m3", "tg:100", "wait", "2026-01-01T00:00:03.000Z"))
            .unwrap();
        f.router.poll_once().await.unwrap();

        // Cursor advanced at pipe time, before the reply arrives.
        assert_eq!(f.router.agent_cursor("tg:100"), "2026-01-01T00:00:03.000Z");

        wait_until(|| f.channel.sent.lock().len() >= 2).await;
        wait_until(|| !f.queue.has_active("tg:100")).await;
        let sent = f.channel.sent.lock();
        assert_eq!(sent[0].1, "first reply");
        assert_eq!(sent[1].1, "piped reply");
        // Typing was requested when the pipe was accepted.
        assert!(f.channel.typing.lock().iter().any(|(_, on)| *on));
    }

    #[tokio::test]
    async fn trigger_filter_holds_batches_until_matched() {
        let f = fixture_with(HAPPY_AGENT, Some("@claw"));
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "just chatter", "2026-01-01T00:00:01.000Z"))
            .unwrap();

        f.router.poll_once().await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(f.channel.sent.lock().is_empty());
        assert_eq!(f.router.agent_cursor("tg:100"), "");
        // Observed, though: the watermark moved.
        assert_eq!(
            f.store.state_get(LAST_TIMESTAMP_KEY).unwrap().as_deref(),
            Some("2026-01-01T00:00:01.000Z")
        );

        f.store
            .insert_message(&user_message("m2", "tg:100", "hey @claw", "2026-01-01T00:00:02.000Z"))
            .unwrap();
        f.router.poll_once().await.unwrap();
        wait_until(|| !f.channel.sent.lock().is_empty()).await;
        wait_until(|| !f.queue.has_active("tg:100")).await;

        // The held message rode along as context.
        assert_eq!(f.router.agent_cursor("tg:100"), "2026-01-01T00:00:02.000Z");
    }

    #[tokio::test]
    async fn recovery_enqueues_groups_with_unclaimed_backlog() {
        let f = fixture(HAPPY_AGENT);
        register_group(&f.store, "tg:100", "standup");
        f.store
            .insert_message(&user_message("m1", "tg:100", "hi", "2026-01-01T00:00:01.000Z"))
            .unwrap();
        // Simulate the crash window: observed globally, never delivered.
        f.store
            .state_set(LAST_TIMESTAMP_KEY, "2026-01-01T00:00:01.000Z")
            .unwrap();

        let router = Router::new(
            f.config.clone(),
            f.store.clone(),
            f.queue.clone(),
            Arc::new(ChannelRegistry::new(vec![f.channel.clone() as Arc<dyn Channel>])),
        )
        .unwrap();
        router.recover_pending().unwrap();

        wait_until(|| !f.channel.sent.lock().is_empty()).await;
        assert_eq!(f.channel.sent.lock()[0].1, "hello");
        assert_eq!(router.agent_cursor("tg:100"), "2026-01-01T00:00:01.000Z");
    }

    #[tokio::test]
    async fn synthetic_prompt_failure_does_not_touch_cursors() {
        let f = fixture(SILENT_FAILURE_AGENT);
        register_group(&f.store, "tg:100", "standup");

        let ok = f.router.process_group("tg:100", Some("daily".into())).await;
        assert!(ok, "synthetic prompts are at-most-once, no retry signal");
        assert_eq!(f.router.agent_cursor("tg:100"), "");
    }

    #[tokio::test]
    async fn main_group_snapshot_sees_everything() {
        let f = fixture(HAPPY_AGENT);
        register_group(&f.store, "tg:100", "main");
        register_group(&f.store, "tg:200", "standup");
        f.router.reload_groups().unwrap();
        f.store
            .upsert_chat("tg:300", Some("Unregistered"), "2026-01-01T00:00:01.000Z", true)
            .unwrap();
        f.store
            .add_task("standup", "other group task", crate::store::tasks::ScheduleType::Interval, "60", chrono::Utc::now(), 10)
            .unwrap();

        let main_group = f.store.group_by_folder("main").unwrap().unwrap();
        let snapshot = f.router.build_snapshot(&main_group, true).unwrap();
        assert_eq!(snapshot.tasks.len(), 1);
        assert_eq!(snapshot.groups.len(), 3);
        assert!(snapshot
            .groups
            .iter()
            .any(|g| g.jid == "tg:300" && !g.is_registered));

        let standup = f.store.group_by_folder("standup").unwrap().unwrap();
        let scoped = f.router.build_snapshot(&standup, false).unwrap();
        assert_eq!(scoped.groups.len(), 1);
        assert_eq!(scoped.groups[0].jid, "tg:200");
    }
}
