//! Local port occupancy probe

use tokio::net::TcpListener;

/// Returns `true` if something already listens on `host:port`.
///
/// A transient listener is bound and dropped immediately; it never outlives
/// the call. Any bind failure counts as occupied.
pub async fn probe_port(host: &str, port: u16) -> bool {
    match TcpListener::bind((host, port)).await {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(e) => {
            tracing::debug!(host = %host, port = port, error = %e, "Port probe bind failed");
            true
        }
    }
}
