pub mod routes;
pub mod session_websocket;
