use std::path::PathBuf;

use warp::Filter;

use crate::session::SessionHub;
use super::session_websocket;

/// Every route the server exposes: the session WebSocket at `/`, the health
/// check, and static files for everything else
pub fn routes(
    hub: SessionHub,
    public_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    session_websocket_route(hub)
        .or(health_check())
        .or(static_files(public_dir))
}

/// Creates the session WebSocket route
pub fn session_websocket_route(
    hub: SessionHub,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path::end()
        .and(warp::ws())
        .and(with_hub(hub))
        .map(|ws: warp::ws::Ws, hub: SessionHub| {
            ws.on_upgrade(move |websocket| session_websocket::handle_session_websocket(websocket, hub))
        })
}

pub fn health_check() -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::json(&serde_json::json!({
                "status": "healthy",
                "service": "Sheet Sync Server",
                "version": env!("CARGO_PKG_VERSION")
            }))
        })
}

/// Static front-end assets
pub fn static_files(
    public_dir: PathBuf,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get().and(warp::fs::dir(public_dir))
}

fn with_hub(
    hub: SessionHub,
) -> impl Filter<Extract = (SessionHub,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || hub.clone())
}
