use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use warp::Filter;

/// Rendered exports the HTTP endpoint serves. The status writer task
/// refreshes both strings from a consistent snapshot; the handlers only
/// read, so protocol state never crosses a thread.
#[derive(Default)]
pub struct ExportCache {
    pub json: String,
    pub prometheus: String,
}

pub type CacheHandle = Arc<RwLock<ExportCache>>;

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Serves `/metrics` (Prometheus text) and `/status` (JSON snapshot) until
/// cancelled.
pub async fn serve(listen: SocketAddr, cache: CacheHandle, cancel: CancellationToken) {
    let metrics_cache = cache.clone();
    let metrics = warp::path("metrics").map(move || {
        let body = metrics_cache
            .read()
            .map(|cache| cache.prometheus.clone())
            .unwrap_or_default();
        warp::reply::with_header(body, "Content-Type", PROMETHEUS_CONTENT_TYPE)
    });

    let status_cache = cache.clone();
    let status = warp::path("status").map(move || {
        let body = status_cache
            .read()
            .map(|cache| cache.json.clone())
            .unwrap_or_default();
        warp::reply::with_header(body, "Content-Type", "application/json")
    });

    let routes = metrics.or(status);

    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(listen, async move {
        cancel.cancelled().await;
    });

    server.await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_roundtrip() {
        let cache: CacheHandle = Arc::new(RwLock::new(ExportCache::default()));

        cache.write().unwrap().prometheus = "bridge_uptime_secs 1\n".to_string();
        assert_eq!(cache.read().unwrap().prometheus, "bridge_uptime_secs 1\n");
    }
}
