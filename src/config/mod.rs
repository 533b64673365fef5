use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// State root (store/, groups/) - computed at load time, not serialized
    #[serde(skip)]
    pub home_dir: PathBuf,

    /// Display name the assistant posts under; rows authored under this
    /// name are never treated as pending work.
    pub assistant_name: String,

    /// Folder of the distinguished group with global visibility.
    pub main_group_folder: String,

    /// Opt-in regex gate on inbound batches. Unset means every batch
    /// dispatches.
    pub trigger_pattern: Option<String>,

    #[serde(default)]
    pub router: RouterConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Seconds between store polls. Zero still makes cooperative progress.
    pub poll_interval_secs: f64,
    /// Milliseconds to wait for active agents during shutdown before killing.
    pub shutdown_grace_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2.0,
            shutdown_grace_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Program that launches one agent container.
    pub program: String,
    /// Arguments for the program. `{container}` and `{workspace}` are
    /// substituted per run.
    pub args: Vec<String>,
    /// Seconds of stream silence before the runner closes the agent's stdin.
    pub idle_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            args: vec![
                "run".into(),
                "--rm".into(),
                "-i".into(),
                "--name".into(),
                "{container}".into(),
                "-v".into(),
                "{workspace}:/workspace".into(),
                "clawbridge-agent:latest".into(),
            ],
            idle_timeout_secs: 1800,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler wake cadence in seconds. The effective cadence is the
    /// smaller of this and the router poll interval, clamped to 1s.
    pub poll_secs: u64,
    /// Upper bound on persisted tasks.
    pub max_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_secs: 30,
            max_tasks: 200,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            home_dir: PathBuf::from("."),
            assistant_name: "Claw".to_string(),
            main_group_folder: "main".to_string(),
            trigger_pattern: None,
            router: RouterConfig::default(),
            agent: AgentConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl Config {
    /// Resolve the state root and apply environment overrides.
    pub fn load() -> Result<Self> {
        let home_dir = match std::env::var("CLAWBRIDGE_HOME") {
            Ok(raw) if !raw.trim().is_empty() => PathBuf::from(raw),
            _ => UserDirs::new()
                .context("Cannot resolve home directory (set CLAWBRIDGE_HOME)")?
                .home_dir()
                .join(".clawbridge"),
        };

        let mut config = Config {
            home_dir,
            ..Config::default()
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(raw) = env_nonempty("POLL_INTERVAL") {
            self.router.poll_interval_secs = raw
                .parse::<f64>()
                .with_context(|| format!("Invalid POLL_INTERVAL: {raw}"))?
                .max(0.0);
        }
        if let Some(raw) = env_nonempty("IDLE_TIMEOUT") {
            self.agent.idle_timeout_secs = raw
                .parse::<u64>()
                .with_context(|| format!("Invalid IDLE_TIMEOUT: {raw}"))?;
        }
        if let Some(raw) = env_nonempty("ASSISTANT_NAME") {
            self.assistant_name = raw;
        }
        if let Some(raw) = env_nonempty("MAIN_GROUP_FOLDER") {
            self.main_group_folder = raw;
        }
        if let Some(raw) = env_nonempty("TRIGGER_PATTERN") {
            self.trigger_pattern = Some(raw);
        }
        if let Some(raw) = env_nonempty("CLAWBRIDGE_AGENT_CMD") {
            self.agent.program = raw;
        }
        if let Some(raw) = env_nonempty("CLAWBRIDGE_AGENT_ARGS") {
            self.agent.args = raw.split_whitespace().map(str::to_string).collect();
        }
        Ok(())
    }

    pub fn store_dir(&self) -> PathBuf {
        self.home_dir.join("store")
    }

    pub fn groups_dir(&self) -> PathBuf {
        self.home_dir.join("groups")
    }

    pub fn db_path(&self) -> PathBuf {
        self.store_dir().join("messages.db")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.store_dir().join("clawbridge.lock")
    }

    /// Validate a group folder name and resolve its workspace directory.
    ///
    /// Folders are relative paths with no `..` segments and no leading
    /// separator; anything that would escape the groups root is refused.
    pub fn resolve_group_folder(&self, folder: &str) -> Result<PathBuf> {
        let trimmed = folder.trim();
        if trimmed.is_empty() {
            anyhow::bail!("Group folder must not be empty");
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            anyhow::bail!("Group folder must be a relative path: {trimmed}");
        }
        for component in candidate.components() {
            match component {
                std::path::Component::Normal(_) => {}
                _ => {
                    anyhow::bail!("Group folder must not contain '..' or root segments: {trimmed}")
                }
            }
        }
        let root = self.groups_dir();
        let resolved = root.join(candidate);
        if !resolved.starts_with(&root) {
            anyhow::bail!("Group folder escapes the workspace root: {trimmed}");
        }
        Ok(resolved)
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
