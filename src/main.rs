use anyhow::Result;
use axum::middleware::from_fn_with_state;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use wa_gateway::client::sim::SimClientFactory;
use wa_gateway::client::ChatClientFactory;
use wa_gateway::shutdown::shutdown_signal;
use wa_gateway::{api, auth, AppState, Config};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();
    init_tracing(&config);

    // The WhatsApp Web transport is pluggable behind ChatClientFactory;
    // without one configured the simulated client keeps the full session
    // lifecycle exercisable.
    let factory: Arc<dyn ChatClientFactory> = Arc::new(SimClientFactory::with_auto_qr());
    warn!("no chat transport configured, running with the simulated client");

    let state = Arc::new(AppState::new(config, factory).await?);

    {
        let supervisor = state.supervisor.clone();
        tokio::spawn(async move {
            supervisor.bootstrap().await;
        });
    }

    let cors = build_cors(&state.config.cors_origins);
    let app = api::build_router(state.clone())
        .layer(from_fn_with_state(state.clone(), auth::bearer_guard))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|value| value == "*") {
        return cors.allow_origin(Any);
    }
    let values = origins
        .iter()
        .filter_map(|value| value.parse().ok())
        .collect::<Vec<_>>();
    if values.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(values))
    }
}
