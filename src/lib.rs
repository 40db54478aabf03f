// Library entrypoint for integration tests and internal reuse.
pub mod ai;
pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod jid;
pub mod media;
pub mod metrics;
pub mod qr;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod state;
pub mod storage;

pub use config::Config;
pub use state::AppState;
