// Simulated chat client. Stands in for the real WhatsApp Web transport
// when none is configured (mirroring the mock-if-unconfigured escape
// hatch the AI models use) and gives tests a scriptable event source.
use crate::client::{ChatClient, ChatClientFactory, ClientEvent, InboundMessage};
use crate::media::MediaHandle;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

/// One outbound operation recorded by the simulated client.
#[derive(Debug, Clone)]
pub enum SentItem {
    Text {
        to: String,
        body: String,
        quoted_id: Option<String>,
    },
    Media {
        to: String,
        mime_type: String,
        filename: String,
        caption: Option<String>,
    },
    Typing {
        to: String,
        active: bool,
    },
}

/// Control handle for a simulated client: feed events in, observe sends.
#[derive(Clone)]
pub struct SimHandle {
    events: mpsc::Sender<ClientEvent>,
    sent: Arc<Mutex<Vec<SentItem>>>,
    destroyed: Arc<AtomicBool>,
}

impl SimHandle {
    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }

    pub async fn emit_qr(&self, raw: &str) {
        self.emit(ClientEvent::Qr(raw.to_string())).await;
    }

    pub async fn emit_ready(&self, jid: &str) {
        self.emit(ClientEvent::Ready {
            jid: jid.to_string(),
        })
        .await;
    }

    pub async fn emit_message(&self, message: InboundMessage) {
        self.emit(ClientEvent::Message(message)).await;
    }

    pub fn sent(&self) -> Vec<SentItem> {
        self.sent.lock().clone()
    }

    pub fn sent_texts(&self) -> Vec<SentItem> {
        self.sent
            .lock()
            .iter()
            .filter(|item| matches!(item, SentItem::Text { .. }))
            .cloned()
            .collect()
    }

    pub fn was_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

struct SimClient {
    events: mpsc::Sender<ClientEvent>,
    sent: Arc<Mutex<Vec<SentItem>>>,
    destroyed: Arc<AtomicBool>,
    auto_qr: bool,
}

#[async_trait]
impl ChatClient for SimClient {
    async fn initialize(&self) -> Result<()> {
        if self.auto_qr {
            let raw = format!("sim-pairing-{}", Uuid::new_v4().simple());
            let _ = self.events.send(ClientEvent::Qr(raw)).await;
        }
        Ok(())
    }

    async fn send_message(&self, to: &str, body: &str, quoted_id: Option<&str>) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("client destroyed"));
        }
        self.sent.lock().push(SentItem::Text {
            to: to.to_string(),
            body: body.to_string(),
            quoted_id: quoted_id.map(|value| value.to_string()),
        });
        Ok(())
    }

    async fn send_media(&self, to: &str, media: &MediaHandle, caption: Option<&str>) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(anyhow!("client destroyed"));
        }
        self.sent.lock().push(SentItem::Media {
            to: to.to_string(),
            mime_type: media.mime_type.clone(),
            filename: media.filename.clone(),
            caption: caption.map(|value| value.to_string()),
        });
        Ok(())
    }

    async fn send_typing(&self, to: &str, active: bool) -> Result<()> {
        self.sent.lock().push(SentItem::Typing {
            to: to.to_string(),
            active,
        });
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        self.destroyed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory keeping a control handle per agent. Re-creating a client for
/// an agent (a reconnect) replaces the stored handle.
#[derive(Default)]
pub struct SimClientFactory {
    auto_qr: bool,
    handles: Mutex<HashMap<String, SimHandle>>,
}

impl SimClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a pairing QR automatically on initialize, like a fresh real
    /// client would.
    pub fn with_auto_qr() -> Self {
        Self {
            auto_qr: true,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, agent_id: &str) -> Option<SimHandle> {
        self.handles.lock().get(agent_id).cloned()
    }
}

impl ChatClientFactory for SimClientFactory {
    fn create(
        &self,
        agent_id: &str,
        _auth_dir: &Path,
    ) -> Result<(Arc<dyn ChatClient>, mpsc::Receiver<ClientEvent>)> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let destroyed = Arc::new(AtomicBool::new(false));
        let handle = SimHandle {
            events: tx.clone(),
            sent: sent.clone(),
            destroyed: destroyed.clone(),
        };
        self.handles.lock().insert(agent_id.to_string(), handle);
        let client = SimClient {
            events: tx,
            sent,
            destroyed,
            auto_qr: self.auto_qr,
        };
        Ok((Arc::new(client), rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_sends_and_exposes_handle() {
        let factory = SimClientFactory::new();
        let (client, _rx) = factory.create("a1", Path::new("/tmp/none")).unwrap();
        client.send_message("6281@c.us", "hello", None).await.unwrap();

        let handle = factory.handle("a1").unwrap();
        assert_eq!(handle.sent().len(), 1);
        assert!(!handle.was_destroyed());

        client.destroy().await.unwrap();
        assert!(handle.was_destroyed());
        assert!(client.send_message("6281@c.us", "late", None).await.is_err());
    }

    #[tokio::test]
    async fn emitted_events_reach_the_receiver() {
        let factory = SimClientFactory::new();
        let (_client, mut rx) = factory.create("a2", Path::new("/tmp/none")).unwrap();
        factory.handle("a2").unwrap().emit_qr("pair-me").await;
        match rx.recv().await {
            Some(ClientEvent::Qr(raw)) => assert_eq!(raw, "pair-me"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
