use sheet_sync_server::config::Config;
use sheet_sync_server::{api, start_session_hub};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json");
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    tracing::info!(
        data_file = %config.storage.data_file.display(),
        public_dir = %config.server.public_dir.display(),
        "Sheet sync server starting"
    );

    let hub = start_session_hub(&config);
    let routes = api::routes::routes(hub.clone(), config.server.public_dir.clone());

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };
    let (addr, server) = match warp::serve(routes)
        .try_bind_with_graceful_shutdown(config.bind_address(), shutdown_signal)
    {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(error = %e, "Failed to bind server address");
            std::process::exit(1);
        }
    };
    tracing::info!(%addr, "Listening");

    server.await;

    tracing::info!("Shutting down, flushing session state");
    if let Err(e) = hub.shutdown().await {
        tracing::error!(error = %e, "Failed to flush session state on shutdown");
    }
}
