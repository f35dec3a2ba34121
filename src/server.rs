//! HTTP surface: `/metrics` and `/healthz`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use crate::engine::Exporter;
use crate::error::ExporterResult;
use crate::exposition::CONTENT_TYPE;

pub fn router(exporter: Arc<Exporter>) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(exporter)
}

async fn metrics(State(exporter): State<Arc<Exporter>>) -> impl IntoResponse {
    let body = exporter.scrape().await;
    ([(header::CONTENT_TYPE, CONTENT_TYPE)], body)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve until `shutdown` resolves; in-flight scrapes are allowed to finish.
pub async fn serve<F>(exporter: Arc<Exporter>, addr: SocketAddr, shutdown: F) -> ExporterResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(
        target: "exporter::server",
        addr = %listener.local_addr()?,
        collectors = ?exporter.collector_names(),
        "Listening"
    );
    axum::serve(listener, router(exporter))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!(target: "exporter::server", "Server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::Collector;
    use crate::collectors::fixtures::Testbed;
    use crate::collectors::BaremetalStatsCollector;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(testbed: &Testbed) -> Router {
        let ctx = Testbed::context();
        let collectors: Vec<Arc<dyn Collector>> =
            vec![Arc::new(BaremetalStatsCollector::new(ctx.clone(), testbed.ironic.clone()))];
        router(Arc::new(Exporter::new(ctx, collectors, Duration::from_secs(300))))
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let testbed = Testbed::new();
        let response = app(&testbed)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], CONTENT_TYPE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("total_nodes{region=\"r1\"} 3\n"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint_survives_backend_failure() {
        let testbed = Testbed::new();
        testbed.ironic.set_failing(true);
        let response = app(&testbed)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_healthz() {
        let testbed = Testbed::new();
        let response = app(&testbed)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let testbed = Testbed::new();
        let response = app(&testbed)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
