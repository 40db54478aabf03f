// Shared harness for the integration suites: a supervisor wired to the
// in-memory storage and the simulated chat client.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use wa_gateway::ai::AiProxy;
use wa_gateway::client::sim::SimClientFactory;
use wa_gateway::client::ChatClientFactory;
use wa_gateway::config::Config;
use wa_gateway::dispatch::Dispatcher;
use wa_gateway::scheduler::RateScheduler;
use wa_gateway::session::Supervisor;
use wa_gateway::storage::{MemoryStorage, Storage};

pub const DEVELOPER_JID: &str = "628999000111@c.us";

pub struct TestGateway {
    pub config: Arc<Config>,
    pub storage: Arc<MemoryStorage>,
    pub factory: Arc<SimClientFactory>,
    pub scheduler: Arc<RateScheduler>,
    pub supervisor: Arc<Supervisor>,
}

pub fn build_gateway(ai_backend_url: &str) -> TestGateway {
    let scratch = std::env::temp_dir().join(format!(
        "wa-gateway-test-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let config = Arc::new(Config {
        ai_backend_url: ai_backend_url.to_string(),
        temp_dir: scratch.join("previews"),
        auth_dir: scratch.join("auth"),
        developer_jid: DEVELOPER_JID.to_string(),
        ..Config::default()
    });

    let storage = Arc::new(MemoryStorage::new());
    let factory = Arc::new(SimClientFactory::new());
    let scheduler = RateScheduler::new();
    let ai = Arc::new(AiProxy::new(
        reqwest::Client::new(),
        config.ai_backend_url.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        ai,
        scheduler.clone(),
        config.developer_jid.clone(),
    ));
    let supervisor = Supervisor::new(
        config.clone(),
        storage.clone() as Arc<dyn Storage>,
        scheduler.clone(),
        factory.clone() as Arc<dyn ChatClientFactory>,
        dispatcher,
    );

    TestGateway {
        config,
        storage,
        factory,
        scheduler,
        supervisor,
    }
}

/// Poll until the condition holds; panics after the timeout. Under a
/// paused clock the sleeps auto-advance virtual time.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
