// Shared application state wired once at startup.
use crate::ai::AiProxy;
use crate::client::ChatClientFactory;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::media::{spawn_temp_sweeper, MediaStore};
use crate::scheduler::RateScheduler;
use crate::session::Supervisor;
use crate::storage::{build_storage, Storage};
use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub scheduler: Arc<RateScheduler>,
    pub ai: Arc<AiProxy>,
    pub media: Arc<MediaStore>,
    pub supervisor: Arc<Supervisor>,
    pub started_at: Instant,
}

impl AppState {
    pub async fn new(config: Config, factory: Arc<dyn ChatClientFactory>) -> Result<Self> {
        crate::metrics::init();
        let config = Arc::new(config);
        let storage = build_storage(&config)?;
        storage.ensure_initialized().await?;

        let http = reqwest::Client::new();
        let scheduler = RateScheduler::new();
        let ai = Arc::new(AiProxy::new(http.clone(), config.ai_backend_url.clone()));
        let media = Arc::new(MediaStore::new(http, config.temp_dir.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            ai.clone(),
            scheduler.clone(),
            config.developer_jid.clone(),
        ));
        let supervisor = Supervisor::new(
            config.clone(),
            storage.clone(),
            scheduler.clone(),
            factory,
            dispatcher,
        );
        spawn_temp_sweeper(config.temp_dir.to_path_buf());

        Ok(Self {
            config,
            storage,
            scheduler,
            ai,
            media,
            supervisor,
            started_at: Instant::now(),
        })
    }
}
