// Per-agent outbound scheduler: a token bucket in front of a bounded
// FIFO queue. Every send to the chat network passes through here, so
// ordering within an agent is the enqueue order and throughput stays
// inside the per-minute budget.
use crate::error::{coded, ErrorCode};
use anyhow::Result;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

pub const TOKENS_PER_MINUTE: f64 = 100.0;
pub const BURST: f64 = 100.0;
pub const QUEUE_LIMIT: usize = 500;
const REFILL_INTERVAL: Duration = Duration::from_secs(1);

type TaskFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;
type Task = Box<dyn FnOnce() -> TaskFuture + Send>;

struct Job {
    task: Task,
    done: oneshot::Sender<Result<Value>>,
}

struct AgentQueue {
    tokens: f64,
    last_refill: Instant,
    queue: VecDeque<Job>,
    processing: bool,
}

impl AgentQueue {
    fn new(burst: f64) -> Self {
        Self {
            tokens: burst,
            last_refill: Instant::now(),
            queue: VecDeque::new(),
            processing: false,
        }
    }
}

pub struct RateScheduler {
    agents: Mutex<HashMap<String, AgentQueue>>,
    tokens_per_minute: f64,
    burst: f64,
    queue_limit: usize,
}

impl RateScheduler {
    pub fn new() -> Arc<Self> {
        Self::with_limits(TOKENS_PER_MINUTE, BURST, QUEUE_LIMIT)
    }

    pub fn with_limits(tokens_per_minute: f64, burst: f64, queue_limit: usize) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            agents: Mutex::new(HashMap::new()),
            tokens_per_minute,
            burst,
            queue_limit,
        });
        let weak = Arc::downgrade(&scheduler);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFILL_INTERVAL);
            loop {
                ticker.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                for agent_id in scheduler.refill_all() {
                    let worker = scheduler.clone();
                    tokio::spawn(async move {
                        worker.drive(agent_id).await;
                    });
                }
            }
        });
        scheduler
    }

    /// Push a task onto the agent's queue. The push is synchronous, so
    /// two `submit` calls made in order stay in order; the returned
    /// receiver resolves with the task's result. Fails fast with
    /// `RATE_LIMITED` once the queue is saturated.
    pub fn submit<F, Fut>(
        self: &Arc<Self>,
        agent_id: &str,
        task: F,
    ) -> Result<oneshot::Receiver<Result<Value>>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let (done, rx) = oneshot::channel();
        let mut agents = self.agents.lock();
        let entry = agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentQueue::new(self.burst));
        if entry.queue.len() >= self.queue_limit {
            return Err(coded(
                ErrorCode::RateLimited,
                format!("outbound queue full for agent {agent_id}"),
            ));
        }
        entry.queue.push_back(Job {
            task: Box::new(move || Box::pin(task()) as TaskFuture),
            done,
        });
        if !entry.processing && entry.tokens >= 1.0 {
            entry.processing = true;
            let worker = self.clone();
            let agent_id = agent_id.to_string();
            tokio::spawn(async move {
                worker.drive(agent_id).await;
            });
        }
        Ok(rx)
    }

    /// Queue a task for the agent and wait for its result.
    pub async fn enqueue<F, Fut>(self: &Arc<Self>, agent_id: &str, task: F) -> Result<Value>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let rx = self.submit(agent_id, task)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(coded(ErrorCode::BadGateway, "outbound job was dropped")),
        }
    }

    pub fn queued_len(&self, agent_id: &str) -> usize {
        self.agents
            .lock()
            .get(agent_id)
            .map(|entry| entry.queue.len())
            .unwrap_or(0)
    }

    /// Single consumer per agent, guarded by the `processing` flag. Each
    /// job costs exactly one token; the loop parks when either tokens or
    /// work run out.
    async fn drive(self: Arc<Self>, agent_id: String) {
        loop {
            let job = {
                let mut agents = self.agents.lock();
                let Some(entry) = agents.get_mut(&agent_id) else {
                    return;
                };
                if entry.tokens < 1.0 || entry.queue.is_empty() {
                    entry.processing = false;
                    return;
                }
                entry.tokens -= 1.0;
                entry.queue.pop_front()
            };
            let Some(job) = job else {
                return;
            };
            let result = (job.task)().await;
            let _ = job.done.send(result);
            tokio::task::yield_now().await;
        }
    }

    /// Refill pass; returns agents that now have both tokens and work,
    /// already marked as processing so the caller can spawn their driver.
    fn refill_all(&self) -> Vec<String> {
        let now = Instant::now();
        let mut poke = Vec::new();
        let mut agents = self.agents.lock();
        for (agent_id, entry) in agents.iter_mut() {
            let elapsed_minutes = now.duration_since(entry.last_refill).as_secs_f64() / 60.0;
            let refill = elapsed_minutes * self.tokens_per_minute;
            if refill < 1.0 {
                continue;
            }
            entry.tokens = (entry.tokens + refill).min(self.burst);
            entry.last_refill = now;
            if !entry.queue.is_empty() && !entry.processing && entry.tokens >= 1.0 {
                entry.processing = true;
                poke.push(agent_id.clone());
            }
        }
        poke
    }
}
