// Chat-network client seam. The gateway treats the WhatsApp Web client
// as an opaque component: it emits lifecycle events on a channel and
// accepts sends. Production deployments plug a real transport in through
// `ChatClientFactory`; tests and dev mode use the simulated client.

pub mod sim;

use crate::media::MediaHandle;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle events a client emits, delivered in order per client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A pairing QR payload is available (raw string, not yet rendered).
    Qr(String),
    /// The session is authenticated and usable; `jid` is the bot's own id.
    Ready { jid: String },
    AuthFailure(String),
    Disconnected(String),
    Message(InboundMessage),
}

/// An inbound chat message as surfaced by the client library.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    pub body: String,
    pub message_type: String,
    pub from_me: bool,
    pub is_status: bool,
    pub is_channel: bool,
    pub mentioned_ids: Vec<String>,
    pub notify_name: Option<String>,
    pub chat_name: Option<String>,
}

impl InboundMessage {
    pub fn is_group(&self) -> bool {
        self.from.ends_with("@g.us")
    }
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Begin connecting. Events arrive on the receiver handed out by the
    /// factory; this call returns once the connection attempt is under way.
    async fn initialize(&self) -> Result<()>;

    async fn send_message(&self, to: &str, body: &str, quoted_id: Option<&str>) -> Result<()>;

    async fn send_media(&self, to: &str, media: &MediaHandle, caption: Option<&str>) -> Result<()>;

    /// Toggle the typing indicator for a chat. Failures are advisory.
    async fn send_typing(&self, to: &str, active: bool) -> Result<()>;

    /// Best-effort shutdown; must be safe to call more than once.
    async fn destroy(&self) -> Result<()>;
}

/// Builds a client bound to an agent's on-disk auth store.
pub trait ChatClientFactory: Send + Sync {
    fn create(
        &self,
        agent_id: &str,
        auth_dir: &Path,
    ) -> Result<(Arc<dyn ChatClient>, mpsc::Receiver<ClientEvent>)>;
}
