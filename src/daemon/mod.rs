use crate::channels::{Channel, ChannelRegistry, LogChannel};
use crate::config::Config;
use crate::lifecycle::SingletonLock;
use crate::queue::GroupQueue;
use crate::router::Router;
use crate::scheduler;
use crate::store::Store;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Start the bridge: singleton lock, store, recovery, message loop and
/// scheduler loop. Returns after Ctrl-C and a graceful queue shutdown.
///
/// `channels` is the adapter set; an empty set falls back to the tracing
/// sink so the core runs stand-alone.
pub async fn run(config: Config, channels: Vec<Arc<dyn Channel>>) -> Result<()> {
    std::fs::create_dir_all(config.groups_dir())
        .with_context(|| format!("Failed to create {}", config.groups_dir().display()))?;

    // Two instances would duplicate every reply. Fatal before any state is
    // touched; the lock file is released on drop.
    let _lock = SingletonLock::acquire(&config.lock_path())?;

    let store = Store::open(&config.db_path())?;
    let channels = if channels.is_empty() {
        vec![Arc::new(LogChannel) as Arc<dyn Channel>]
    } else {
        channels
    };
    let registry = Arc::new(ChannelRegistry::new(channels));
    let queue = GroupQueue::new();

    let router = Router::new(config.clone(), store.clone(), Arc::clone(&queue), Arc::clone(&registry))?;
    router
        .recover_pending()
        .context("Startup recovery scan failed")?;

    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            if let Err(e) = router.run().await {
                tracing::error!("Message loop failed: {e:#}");
            }
        }));
    }

    {
        let scheduler_config = config.clone();
        let scheduler_store = store.clone();
        let enqueue_queue = Arc::clone(&queue);
        let enqueue: scheduler::EnqueuePromptFn = Arc::new(move |jid, prompt| {
            enqueue_queue.enqueue_prompt(&jid, prompt);
        });
        handles.push(tokio::spawn(async move {
            if let Err(e) = scheduler::run(scheduler_config, scheduler_store, enqueue).await {
                tracing::error!("Scheduler failed: {e:#}");
            }
        }));
    }

    println!("clawbridge daemon started");
    println!("   Store:  {}", config.db_path().display());
    println!("   Groups: {}", config.groups_dir().display());
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining agents");

    queue
        .shutdown(Duration::from_millis(config.router.shutdown_grace_ms))
        .await;
    registry.disconnect_all().await;

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
