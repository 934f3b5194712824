use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use baby_llama_service::{AppConfig, CompletionService, RpcService, ServingState, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        checkpoint = %config.checkpoint_path.display(),
        device = ?config.device,
        "loading model artifacts"
    );

    let state = Arc::new(ServingState::initialize(&config)?);

    let http_service = CompletionService::new(state.clone(), config.defaults, config.http_workers)
        .with_timeout(config.generation_timeout);
    let rpc_service = CompletionService::new(state, config.defaults, config.rpc_workers)
        .with_timeout(config.generation_timeout);

    let listener = TcpListener::bind(config.http_addr).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, workers = config.http_workers, "REST server ready");
    let http = axum::serve(listener, build_router(http_service))
        .with_graceful_shutdown(shutdown_signal());

    tracing::info!(addr = %config.grpc_addr, workers = config.rpc_workers, "gRPC server ready");
    let grpc = tonic::transport::Server::builder()
        .add_service(RpcService::new(rpc_service).into_server())
        .serve_with_shutdown(config.grpc_addr, shutdown_signal());

    tokio::try_join!(
        async { http.await.map_err(anyhow::Error::from) },
        async { grpc.await.map_err(anyhow::Error::from) },
    )?;

    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,hyper=warn,h2=warn,axum::rejection=trace".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
