use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use clawbridge::scheduler::schedule;
use clawbridge::store::tasks::{ScheduleType, TaskStatus};
use clawbridge::store::{now_rfc3339, RegisteredGroup, Store, LAST_TIMESTAMP_KEY};
use clawbridge::{daemon, Config};

/// Bridge group chats into isolated, containerized AI agents.
#[derive(Parser, Debug)]
#[command(name = "clawbridge")]
#[command(version = "0.1.0")]
#[command(about = "Route group-chat messages into containerized AI agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bridge daemon
    Run,
    /// Manage registered groups
    Group {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Manage scheduled tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Show cursors and pending work
    Status,
}

#[derive(Subcommand, Debug)]
enum GroupCommands {
    /// Register a group chat
    Add {
        /// Chat JID, e.g. tg:100
        jid: String,
        /// Display name
        name: String,
        /// Workspace folder (relative, no '..')
        folder: String,
        /// Optional per-group trigger hint for adapters
        #[arg(long)]
        trigger: Option<String>,
    },
    /// List registered groups
    List,
    /// Unregister a group chat
    Remove { jid: String },
}

#[derive(Subcommand, Debug)]
enum TaskCommands {
    /// Add a scheduled prompt for a group folder
    Add {
        /// Target group folder
        folder: String,
        /// Prompt text fed to the agent
        prompt: String,
        /// Schedule kind: cron, interval, or once
        schedule_type: String,
        /// Cron expression, interval seconds, or RFC3339 time
        schedule_value: String,
    },
    /// List tasks
    List,
    /// Remove a task
    Remove { id: String },
    /// Pause a task
    Pause { id: String },
    /// Resume a paused task
    Resume { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command {
        Commands::Run => daemon::run(config, vec![]).await,
        Commands::Group { command } => handle_group(command, &config),
        Commands::Task { command } => handle_task(command, &config),
        Commands::Status => show_status(&config),
    }
}

fn handle_group(command: GroupCommands, config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path())?;
    match command {
        GroupCommands::Add {
            jid,
            name,
            folder,
            trigger,
        } => {
            // Folder policy is enforced before any state is written.
            let workspace = config.resolve_group_folder(&folder)?;
            std::fs::create_dir_all(&workspace)
                .with_context(|| format!("Failed to create {}", workspace.display()))?;

            store.register_group(&RegisteredGroup {
                jid: jid.clone(),
                name,
                folder: folder.clone(),
                trigger,
                added_at: now_rfc3339(),
            })?;
            println!("Registered {jid} -> {folder}");
            println!("  Workspace: {}", workspace.display());
            Ok(())
        }
        GroupCommands::List => {
            let groups = store.registered_groups()?;
            if groups.is_empty() {
                println!("No registered groups yet.");
                println!("\nUsage: clawbridge group add <jid> <name> <folder>");
                return Ok(());
            }
            println!("Registered groups ({}):", groups.len());
            for group in groups {
                let trigger = group.trigger.as_deref().unwrap_or("-");
                println!(
                    "- {} | {} | folder={} | trigger={} | added={}",
                    group.jid, group.name, group.folder, trigger, group.added_at
                );
            }
            Ok(())
        }
        GroupCommands::Remove { jid } => {
            if store.remove_group(&jid)? {
                println!("Removed {jid}");
                Ok(())
            } else {
                anyhow::bail!("No registered group with JID '{jid}'");
            }
        }
    }
}

fn handle_task(command: TaskCommands, config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path())?;
    match command {
        TaskCommands::Add {
            folder,
            prompt,
            schedule_type,
            schedule_value,
        } => {
            if store.group_by_folder(&folder)?.is_none() {
                anyhow::bail!("No registered group uses folder '{folder}'");
            }
            let schedule_type = ScheduleType::try_from(schedule_type.as_str())?;
            let next_run = schedule::initial_next_run(schedule_type, &schedule_value, Utc::now())?;

            let task = store.add_task(
                &folder,
                &prompt,
                schedule_type,
                &schedule_value,
                next_run,
                config.scheduler.max_tasks,
            )?;
            println!("Added task {}", task.id);
            println!("  Next run: {}", task.next_run.to_rfc3339());
            Ok(())
        }
        TaskCommands::List => {
            let tasks = store.list_tasks()?;
            if tasks.is_empty() {
                println!("No scheduled tasks yet.");
                println!("\nUsage: clawbridge task add <folder> '<prompt>' interval 3600");
                return Ok(());
            }
            println!("Scheduled tasks ({}):", tasks.len());
            for task in tasks {
                println!(
                    "- {} | {} | {} {} | {} | next={}\n    prompt: {}",
                    task.id,
                    task.group_folder,
                    task.schedule_type.as_str(),
                    task.schedule_value,
                    task.status.as_str(),
                    task.next_run.to_rfc3339(),
                    task.prompt
                );
            }
            Ok(())
        }
        TaskCommands::Remove { id } => {
            store.remove_task(&id)?;
            println!("Removed task {id}");
            Ok(())
        }
        TaskCommands::Pause { id } => {
            store.set_task_status(&id, TaskStatus::Paused)?;
            println!("Paused task {id}");
            Ok(())
        }
        TaskCommands::Resume { id } => {
            store.set_task_status(&id, TaskStatus::Active)?;
            println!("Resumed task {id}");
            Ok(())
        }
    }
}

fn show_status(config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path())?;

    let watermark = store.state_get(LAST_TIMESTAMP_KEY)?.unwrap_or_default();
    println!(
        "Observation watermark: {}",
        if watermark.is_empty() { "-" } else { watermark.as_str() }
    );

    let groups = store.registered_groups()?;
    if groups.is_empty() {
        println!("No registered groups.");
        return Ok(());
    }

    let cursors: std::collections::HashMap<String, String> =
        store.agent_cursors()?.into_iter().collect();

    println!("Groups ({}):", groups.len());
    for group in groups {
        let cursor = cursors.get(&group.jid).cloned().unwrap_or_default();
        let pending = store
            .get_messages_since(&group.jid, &cursor, &config.assistant_name)?
            .len();
        let session = store.session_for(&group.folder)?;
        println!(
            "- {} ({}) | cursor={} | pending={} | session={}",
            group.jid,
            group.folder,
            if cursor.is_empty() { "-" } else { cursor.as_str() },
            pending,
            session.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
