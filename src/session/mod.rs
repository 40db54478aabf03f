// Session lifecycle and supervision. One live session per agent, driven
// by the client event stream; reconnects back off exponentially and QR
// delivery to slow HTTP callers goes through a single-waiter rendezvous.

pub mod machine;

use crate::ai;
use crate::client::{ChatClient, ChatClientFactory, ClientEvent, InboundMessage};
use crate::config::Config;
use crate::dispatch::{Dispatcher, InboundContext};
use crate::error::{coded, ErrorCode};
use crate::jid::normalize_jid;
use crate::media::MediaHandle;
use crate::metrics;
use crate::qr::{encode_qr_png, QrImage};
use crate::scheduler::RateScheduler;
use crate::storage::{AgentRecord, Storage, StatusTouch, UpsertAgentParams};
use anyhow::Result;
use chrono::{DateTime, Utc};
use machine::{LifecycleEvent, SessionStatus, Step};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub const QR_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
const RECORD_STALE_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStateView {
    pub is_ready: bool,
    pub status: String,
    pub has_qr: bool,
    pub qr_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub agent_id: String,
    pub agent_name: String,
    pub user_id: i64,
    pub status: String,
    pub endpoint_url_run: Option<String>,
    pub last_connected_at: Option<DateTime<Utc>>,
    pub last_disconnected_at: Option<DateTime<Utc>>,
    pub live_state: LiveStateView,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QrView {
    pub agent_id: String,
    pub qr: Option<QrImage>,
    pub qr_updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_removed: Option<bool>,
}

struct QrWaiter {
    tx: watch::Sender<Option<QrImage>>,
    id: u64,
}

struct LiveSession {
    record: AgentRecord,
    record_fetched_at: Instant,
    client: Arc<dyn ChatClient>,
    bot_jid: Option<String>,
    qr: Option<QrImage>,
    qr_updated_at: Option<DateTime<Utc>>,
    is_ready: bool,
    status: SessionStatus,
    shutting_down: bool,
    metrics_counted: bool,
    qr_waiter: Option<QrWaiter>,
    event_task: Option<JoinHandle<()>>,
}

type SessionSlot = Arc<Mutex<LiveSession>>;

pub struct Supervisor {
    config: Arc<Config>,
    storage: Arc<dyn Storage>,
    scheduler: Arc<RateScheduler>,
    factory: Arc<dyn ChatClientFactory>,
    dispatcher: Arc<Dispatcher>,
    sessions: Mutex<HashMap<String, SessionSlot>>,
    reconnect_timers: Mutex<HashMap<String, JoinHandle<()>>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    waiter_ids: AtomicU64,
}

impl Supervisor {
    pub fn new(
        config: Arc<Config>,
        storage: Arc<dyn Storage>,
        scheduler: Arc<RateScheduler>,
        factory: Arc<dyn ChatClientFactory>,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            scheduler,
            factory,
            dispatcher,
            sessions: Mutex::new(HashMap::new()),
            reconnect_timers: Mutex::new(HashMap::new()),
            op_locks: Mutex::new(HashMap::new()),
            waiter_ids: AtomicU64::new(1),
        })
    }

    /// Serialises the public operations per agent. Event handling stays
    /// outside this lock; the client delivers events sequentially.
    async fn op_guard(&self, agent_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.op_locks.lock();
            locks
                .entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn create_or_resume(
        self: &Arc<Self>,
        user_id: i64,
        agent_id: &str,
        agent_name: &str,
        api_key: Option<&str>,
    ) -> Result<StatusView> {
        let _guard = self.op_guard(agent_id).await;

        let effective_key = match self.storage.latest_active_api_key(user_id).await? {
            Some(key) => key.access_token,
            None => api_key
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(|value| value.to_string())
                .ok_or_else(|| {
                    coded(
                        ErrorCode::InvalidPayload,
                        format!("no api key available for user {user_id}"),
                    )
                })?,
        };

        let record = self
            .storage
            .upsert_agent(&UpsertAgentParams {
                user_id,
                agent_id: agent_id.to_string(),
                agent_name: agent_name.to_string(),
                api_key: effective_key,
                endpoint_url_run: Some(ai::default_endpoint(
                    &self.config.ai_backend_url,
                    agent_id,
                )),
            })
            .await?;

        self.ensure_session(record.clone()).await?;
        Ok(self.status_view(record))
    }

    pub async fn get_status(&self, agent_id: &str) -> Result<StatusView> {
        let record = self.require_record(agent_id).await?;
        Ok(self.status_view(record))
    }

    pub async fn reconnect(self: &Arc<Self>, agent_id: &str) -> Result<StatusView> {
        let _guard = self.op_guard(agent_id).await;
        let record = self.require_record(agent_id).await?;
        self.teardown(agent_id, true, true).await;
        self.ensure_session(record).await?;
        let record = self.require_record(agent_id).await?;
        Ok(self.status_view(record))
    }

    pub async fn delete(self: &Arc<Self>, agent_id: &str) -> Result<DeleteOutcome> {
        let _guard = self.op_guard(agent_id).await;
        let existed = self.storage.get_agent(agent_id).await?.is_some();
        // Best-effort teardown happens even when the row is already gone.
        self.teardown(agent_id, true, true).await;
        let deleted = self.storage.delete_agent(agent_id).await?;
        if existed && deleted {
            Ok(DeleteOutcome {
                deleted: true,
                already_removed: None,
            })
        } else {
            Ok(DeleteOutcome {
                deleted: false,
                already_removed: Some(true),
            })
        }
    }

    pub async fn generate_qr(self: &Arc<Self>, agent_id: &str) -> Result<QrView> {
        {
            let _guard = self.op_guard(agent_id).await;
            let record = self.require_record(agent_id).await?;
            self.ensure_session(record).await?;
        }
        // The rendezvous itself runs outside the per-agent lock so other
        // operations are not blocked for up to a minute.
        self.wait_for_qr(agent_id, QR_WAIT_TIMEOUT).await
    }

    pub async fn send_text(
        self: &Arc<Self>,
        agent_id: &str,
        to: &str,
        message: &str,
        quoted_id: Option<String>,
    ) -> Result<Value> {
        let client = self.ready_client(agent_id).await?;
        let to = normalize_jid(to)
            .map_err(|err| coded(ErrorCode::InvalidPayload, err.to_string()))?;
        let body = message.to_string();
        let agent_label = agent_id.to_string();
        self.scheduler
            .enqueue(agent_id, move || async move {
                client
                    .send_message(&to, &body, quoted_id.as_deref())
                    .await?;
                metrics::MESSAGES_SENT
                    .with_label_values(&[&agent_label])
                    .inc();
                Ok(json!({ "delivered": true }))
            })
            .await
    }

    pub async fn send_media(
        self: &Arc<Self>,
        agent_id: &str,
        to: &str,
        media: MediaHandle,
        caption: Option<String>,
    ) -> Result<Value> {
        let client = self.ready_client(agent_id).await?;
        let to = normalize_jid(to)
            .map_err(|err| coded(ErrorCode::InvalidPayload, err.to_string()))?;
        let agent_label = agent_id.to_string();
        self.scheduler
            .enqueue(agent_id, move || async move {
                client.send_media(&to, &media, caption.as_deref()).await?;
                metrics::MESSAGES_SENT
                    .with_label_values(&[&agent_label])
                    .inc();
                Ok(json!({ "delivered": true }))
            })
            .await
    }

    /// Re-ensure sessions for every bootstrappable row. Invoked once at
    /// startup; per-agent failures are logged and skipped.
    pub async fn bootstrap(self: &Arc<Self>) {
        let rows = match self.storage.list_bootstrappable().await {
            Ok(rows) => rows,
            Err(err) => {
                error!("bootstrap query failed: {err:#}");
                return;
            }
        };
        info!("rehydrating {} agent session(s)", rows.len());
        for record in rows {
            let agent_id = record.agent_id.clone();
            if let Err(err) = self.ensure_session(record).await {
                warn!(agent_id = %agent_id, "bootstrap failed: {err:#}");
            }
        }
    }

    async fn require_record(&self, agent_id: &str) -> Result<AgentRecord> {
        self.storage.get_agent(agent_id).await?.ok_or_else(|| {
            coded(
                ErrorCode::SessionNotFound,
                format!("no session record for agent {agent_id}"),
            )
        })
    }

    /// Idempotent: an existing live session only gets its cached record
    /// refreshed. Otherwise a client is built, its event pump spawned and
    /// initialisation kicked off.
    async fn ensure_session(self: &Arc<Self>, record: AgentRecord) -> Result<()> {
        let agent_id = record.agent_id.clone();
        if let Some(slot) = self.slot(&agent_id) {
            let mut session = slot.lock();
            session.record = record;
            session.record_fetched_at = Instant::now();
            return Ok(());
        }

        let auth_dir = self.config.agent_auth_dir(&agent_id);
        if let Err(err) = tokio::fs::create_dir_all(&auth_dir).await {
            warn!(agent_id = %agent_id, "auth dir create failed: {err}");
        }
        let (client, events) = self.factory.create(&agent_id, &auth_dir)?;

        let slot: SessionSlot = Arc::new(Mutex::new(LiveSession {
            record,
            record_fetched_at: Instant::now(),
            client: client.clone(),
            bot_jid: None,
            qr: None,
            qr_updated_at: None,
            is_ready: false,
            status: SessionStatus::Initialising,
            shutting_down: false,
            metrics_counted: false,
            qr_waiter: None,
            event_task: None,
        }));
        self.sessions.lock().insert(agent_id.clone(), slot.clone());

        let pump = self.spawn_event_pump(agent_id.clone(), events);
        slot.lock().event_task = Some(pump);

        if let Err(err) = client.initialize().await {
            error!(agent_id = %agent_id, "client initialize failed: {err:#}");
            self.schedule_restart(&agent_id, "initialize failed", false, 1, None);
        }
        Ok(())
    }

    fn spawn_event_pump(
        self: &Arc<Self>,
        agent_id: String,
        mut events: mpsc::Receiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let supervisor = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                supervisor.handle_event(&agent_id, event).await;
            }
            debug!(agent_id = %agent_id, "client event stream closed");
        })
    }

    async fn handle_event(self: &Arc<Self>, agent_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Qr(raw) => self.on_qr(agent_id, &raw).await,
            ClientEvent::Ready { jid } => self.on_ready(agent_id, jid).await,
            ClientEvent::AuthFailure(message) => {
                self.on_failure(agent_id, LifecycleEvent::AuthFailure, &message)
                    .await;
            }
            ClientEvent::Disconnected(reason) => {
                let event = LifecycleEvent::Disconnected {
                    mentions_logout: machine::mentions_logout(&reason),
                };
                self.on_failure(agent_id, event, &reason).await;
            }
            ClientEvent::Message(message) => self.on_message(agent_id, message).await,
        }
    }

    async fn on_qr(self: &Arc<Self>, agent_id: &str, raw: &str) {
        let Some(slot) = self.slot(agent_id) else {
            return;
        };
        let image = match encode_qr_png(raw) {
            Ok(image) => image,
            Err(err) => {
                error!(agent_id = %agent_id, "qr encode failed: {err:#}");
                return;
            }
        };
        {
            let mut session = slot.lock();
            if !matches!(step_of(&session, LifecycleEvent::QrIssued), Step::PublishQr) {
                return;
            }
            session.qr = Some(image.clone());
            session.qr_updated_at = Some(Utc::now());
            session.status = SessionStatus::AwaitingQr;
            if let Some(waiter) = session.qr_waiter.take() {
                let _ = waiter.tx.send(Some(image));
            }
        }
        self.persist_status(agent_id, SessionStatus::AwaitingQr, StatusTouch::None)
            .await;
    }

    async fn on_ready(self: &Arc<Self>, agent_id: &str, jid: String) {
        let Some(slot) = self.slot(agent_id) else {
            return;
        };
        {
            let mut session = slot.lock();
            if !matches!(step_of(&session, LifecycleEvent::Ready), Step::Activate) {
                return;
            }
            session.is_ready = true;
            session.status = SessionStatus::Connected;
            session.bot_jid = Some(jid);
            if !session.metrics_counted {
                metrics::SESSIONS_ACTIVE.inc();
                session.metrics_counted = true;
            }
        }
        info!(agent_id = %agent_id, "session connected");
        self.persist_status(agent_id, SessionStatus::Connected, StatusTouch::Connected)
            .await;
    }

    async fn on_failure(self: &Arc<Self>, agent_id: &str, event: LifecycleEvent, detail: &str) {
        let Some(slot) = self.slot(agent_id) else {
            return;
        };
        let step = {
            let mut session = slot.lock();
            let step = step_of(&session, event);
            if let Step::Fail { status, .. } = step {
                session.is_ready = false;
                session.status = status;
                if session.metrics_counted {
                    metrics::SESSIONS_ACTIVE.dec();
                    session.metrics_counted = false;
                }
            }
            step
        };
        let Step::Fail { status, clear_auth } = step else {
            return;
        };
        warn!(agent_id = %agent_id, status = status.as_str(), "session lost: {detail}");
        self.persist_status(agent_id, status, StatusTouch::Disconnected)
            .await;
        self.schedule_restart(agent_id, detail, clear_auth, 1, None);
    }

    async fn on_message(self: &Arc<Self>, agent_id: &str, message: InboundMessage) {
        let Some(slot) = self.slot(agent_id) else {
            return;
        };
        let stale = {
            let session = slot.lock();
            if session.shutting_down {
                return;
            }
            session.record_fetched_at.elapsed() > RECORD_STALE_AFTER
        };
        if stale {
            match self.storage.get_agent(agent_id).await {
                Ok(Some(record)) => {
                    let mut session = slot.lock();
                    session.record = record;
                    session.record_fetched_at = Instant::now();
                }
                Ok(None) => {
                    warn!(agent_id = %agent_id, "record vanished, dropping inbound message");
                    return;
                }
                Err(err) => {
                    warn!(agent_id = %agent_id, "record refresh failed: {err:#}");
                }
            }
        }
        let ctx = {
            let session = slot.lock();
            InboundContext {
                client: session.client.clone(),
                record: session.record.clone(),
                bot_jid: session.bot_jid.clone(),
            }
        };
        self.dispatcher.handle(ctx, message).await;
    }

    /// At most one pending restart per agent. The timer refetches the
    /// record when it fires, so a deletion in the meantime aborts the
    /// restart.
    fn schedule_restart(
        self: &Arc<Self>,
        agent_id: &str,
        reason: &str,
        clear_auth: bool,
        attempt: u32,
        previous_delay: Option<Duration>,
    ) {
        if let Some(slot) = self.slot(agent_id) {
            if slot.lock().shutting_down {
                return;
            }
        }
        let delay = previous_delay
            .map(machine::retry_delay)
            .unwrap_or_else(|| machine::restart_delay(attempt));
        let mut timers = self.reconnect_timers.lock();
        if timers.contains_key(agent_id) {
            return;
        }
        info!(
            agent_id = %agent_id,
            attempt,
            delay_s = delay.as_secs(),
            "restart scheduled: {reason}"
        );
        let supervisor = self.clone();
        let agent_key = agent_id.to_string();
        let reason = reason.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            supervisor.reconnect_timers.lock().remove(&agent_key);
            supervisor
                .restart_now(&agent_key, &reason, clear_auth, attempt, delay)
                .await;
        });
        timers.insert(agent_id.to_string(), timer);
    }

    async fn restart_now(
        self: &Arc<Self>,
        agent_id: &str,
        reason: &str,
        clear_auth: bool,
        attempt: u32,
        delay: Duration,
    ) {
        let record = match self.storage.get_agent(agent_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                debug!(agent_id = %agent_id, "record gone, restart aborted");
                return;
            }
            Err(err) => {
                warn!(agent_id = %agent_id, "restart record fetch failed: {err:#}");
                self.schedule_restart(agent_id, reason, clear_auth, attempt + 1, Some(delay));
                return;
            }
        };
        self.teardown(agent_id, true, clear_auth).await;
        if let Err(err) = self.ensure_session(record).await {
            warn!(agent_id = %agent_id, "restart failed: {err:#}");
            self.schedule_restart(agent_id, reason, clear_auth, attempt + 1, Some(delay));
        }
    }

    /// Tear down the live session. The DB row survives unless
    /// `preserve_db` is false; the auth store survives unless
    /// `clear_auth` is set.
    pub async fn teardown(&self, agent_id: &str, preserve_db: bool, clear_auth: bool) {
        if let Some(timer) = self.reconnect_timers.lock().remove(agent_id) {
            timer.abort();
        }
        let slot = self.sessions.lock().remove(agent_id);
        if let Some(slot) = slot {
            let (client, event_task, waiter, counted) = {
                let mut session = slot.lock();
                session.shutting_down = true;
                session.is_ready = false;
                let counted = session.metrics_counted;
                session.metrics_counted = false;
                (
                    session.client.clone(),
                    session.event_task.take(),
                    session.qr_waiter.take(),
                    counted,
                )
            };
            if let Err(err) = client.destroy().await {
                warn!(agent_id = %agent_id, "client destroy failed: {err:#}");
            }
            if counted {
                metrics::SESSIONS_ACTIVE.dec();
            }
            if let Some(task) = event_task {
                task.abort();
            }
            // Dropping the sender fails any pending QR rendezvous with
            // SESSION_NOT_READY on the waiting side.
            drop(waiter);
        }
        if !preserve_db {
            self.persist_status(agent_id, SessionStatus::Disconnected, StatusTouch::Disconnected)
                .await;
        }
        if clear_auth {
            let dir = self.config.agent_auth_dir(agent_id);
            if let Err(err) = tokio::fs::remove_dir_all(&dir).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(agent_id = %agent_id, "auth store removal failed: {err}");
                }
            }
        }
    }

    /// Return the cached QR immediately, or join the single pending
    /// rendezvous until the client emits one.
    pub async fn wait_for_qr(&self, agent_id: &str, timeout: Duration) -> Result<QrView> {
        let (mut rx, waiter_id) = {
            let Some(slot) = self.slot(agent_id) else {
                return Err(coded(
                    ErrorCode::SessionNotReady,
                    format!("no live session for agent {agent_id}"),
                ));
            };
            let mut session = slot.lock();
            if let Some(qr) = session.qr.clone() {
                return Ok(QrView {
                    agent_id: agent_id.to_string(),
                    qr: Some(qr),
                    qr_updated_at: session.qr_updated_at,
                });
            }
            match &session.qr_waiter {
                Some(waiter) => (waiter.tx.subscribe(), waiter.id),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let id = self.waiter_ids.fetch_add(1, Ordering::Relaxed);
                    session.qr_waiter = Some(QrWaiter { tx, id });
                    (rx, id)
                }
            }
        };

        let waited = tokio::time::timeout(timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return None;
                }
                let current = rx.borrow_and_update().clone();
                if current.is_some() {
                    return current;
                }
            }
        })
        .await;

        match waited {
            Ok(Some(qr)) => {
                let qr_updated_at = self
                    .slot(agent_id)
                    .and_then(|slot| slot.lock().qr_updated_at);
                Ok(QrView {
                    agent_id: agent_id.to_string(),
                    qr: Some(qr),
                    qr_updated_at,
                })
            }
            Ok(None) => Err(coded(
                ErrorCode::SessionNotReady,
                "session closed while waiting for QR",
            )),
            Err(_) => {
                if let Some(slot) = self.slot(agent_id) {
                    let mut session = slot.lock();
                    if session
                        .qr_waiter
                        .as_ref()
                        .is_some_and(|waiter| waiter.id == waiter_id)
                    {
                        session.qr_waiter = None;
                    }
                }
                Err(coded(
                    ErrorCode::SessionNotReady,
                    "timed out waiting for QR",
                ))
            }
        }
    }

    /// The agent's client once the session reports ready. Distinguishes
    /// "unknown agent" from "known but not connected".
    async fn ready_client(&self, agent_id: &str) -> Result<Arc<dyn ChatClient>> {
        if let Some(slot) = self.slot(agent_id) {
            let session = slot.lock();
            if session.is_ready {
                return Ok(session.client.clone());
            }
            return Err(coded(
                ErrorCode::SessionNotReady,
                format!("session for agent {agent_id} is not ready"),
            ));
        }
        if self.storage.get_agent(agent_id).await?.is_none() {
            return Err(coded(
                ErrorCode::SessionNotFound,
                format!("no session record for agent {agent_id}"),
            ));
        }
        Err(coded(
            ErrorCode::SessionNotReady,
            format!("session for agent {agent_id} is not live"),
        ))
    }

    fn slot(&self, agent_id: &str) -> Option<SessionSlot> {
        self.sessions.lock().get(agent_id).cloned()
    }

    fn status_view(&self, record: AgentRecord) -> StatusView {
        let live = self.slot(&record.agent_id).map(|slot| {
            let session = slot.lock();
            LiveStateView {
                is_ready: session.is_ready,
                status: session.status.as_str().to_string(),
                has_qr: session.qr.is_some(),
                qr_updated_at: session.qr_updated_at,
            }
        });
        let live_state = live.unwrap_or_else(|| LiveStateView {
            is_ready: false,
            status: record.status.clone(),
            has_qr: false,
            qr_updated_at: None,
        });
        StatusView {
            agent_id: record.agent_id,
            agent_name: record.agent_name,
            user_id: record.user_id,
            status: record.status,
            endpoint_url_run: record.endpoint_url_run,
            last_connected_at: record.last_connected_at,
            last_disconnected_at: record.last_disconnected_at,
            live_state,
        }
    }

    async fn persist_status(&self, agent_id: &str, status: SessionStatus, touch: StatusTouch) {
        if let Err(err) = self
            .storage
            .set_status(agent_id, status.as_str(), touch)
            .await
        {
            // Event-driven persistence failures never propagate.
            warn!(agent_id = %agent_id, "status persist failed: {err:#}");
        }
    }
}

fn step_of(session: &LiveSession, event: LifecycleEvent) -> Step {
    machine::step(session.shutting_down, event)
}
