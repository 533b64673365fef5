use async_trait::async_trait;
use std::sync::Arc;

/// Core channel trait, implemented for each messaging platform.
///
/// Adapters own the wire protocol and the JID prefix convention (e.g. `tg:`);
/// the bridge only routes by `owns_jid` and calls the capabilities below.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Human-readable channel name
    fn name(&self) -> &str;

    /// Whether this channel is responsible for the given chat JID.
    fn owns_jid(&self, jid: &str) -> bool;

    /// Send a message to a chat on this channel.
    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()>;

    /// Toggle the platform's typing indicator. Channels without one no-op.
    async fn set_typing(&self, _jid: &str, _typing: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tear down the channel connection.
    async fn disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Routes outbound traffic to the first channel that claims the JID.
pub struct ChannelRegistry {
    channels: Vec<Arc<dyn Channel>>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<Arc<dyn Channel>>) -> Self {
        Self { channels }
    }

    fn route(&self, jid: &str) -> Option<&Arc<dyn Channel>> {
        self.channels.iter().find(|c| c.owns_jid(jid))
    }

    pub async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        match self.route(jid) {
            Some(channel) => channel.send_message(jid, text).await,
            None => anyhow::bail!("No channel owns JID {jid}"),
        }
    }

    /// Best-effort typing indicator. Failures are logged, never propagated.
    pub async fn set_typing(&self, jid: &str, typing: bool) {
        if let Some(channel) = self.route(jid) {
            if let Err(e) = channel.set_typing(jid, typing).await {
                tracing::debug!("Typing indicator for {jid} failed: {e:#}");
            }
        }
    }

    pub async fn disconnect_all(&self) {
        for channel in &self.channels {
            if let Err(e) = channel.disconnect().await {
                tracing::warn!("Channel {} disconnect failed: {e:#}", channel.name());
            }
        }
    }
}

/// Tracing-only sink so the daemon can run without a real adapter wired in.
pub struct LogChannel;

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    fn owns_jid(&self, _jid: &str) -> bool {
        true
    }

    async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
        tracing::info!("[{jid}] {text}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingChannel {
        prefix: &'static str,
        sent: Mutex<Vec<(String, String)>>,
    }

    impl RecordingChannel {
        fn new(prefix: &'static str) -> Arc<Self> {
            Arc::new(Self {
                prefix,
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            self.prefix
        }

        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with(self.prefix)
        }

        async fn send_message(&self, jid: &str, text: &str) -> anyhow::Result<()> {
            self.sent.lock().push((jid.to_string(), text.to_string()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn routes_by_first_matching_prefix() {
        let tg = RecordingChannel::new("tg:");
        let wa = RecordingChannel::new("wa:");
        let registry = ChannelRegistry::new(vec![tg.clone(), wa.clone()]);

        registry.send_message("wa:200", "hello").await.unwrap();

        assert!(tg.sent.lock().is_empty());
        let sent = wa.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "wa:200");
    }

    #[tokio::test]
    async fn unrouted_jid_is_an_error() {
        let registry = ChannelRegistry::new(vec![]);
        let err = registry.send_message("tg:100", "hello").await.unwrap_err();
        assert!(err.to_string().contains("No channel owns"));
    }

    #[tokio::test]
    async fn default_capabilities_no_op() {
        let tg = RecordingChannel::new("tg:");
        assert!(tg.set_typing("tg:100", true).await.is_ok());
        assert!(tg.disconnect().await.is_ok());
    }
}
