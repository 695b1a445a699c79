// tests/admin_http.rs
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use keyword_notifier::metrics::admin_router;
use tower::ServiceExt;

#[tokio::test]
async fn health_answers_ok() {
    let resp = admin_router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"ok");
}

#[tokio::test]
async fn unknown_route_is_404() {
    let resp = admin_router()
        .oneshot(Request::get("/subscriptions").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

// Only test in this binary that installs the global recorder.
#[tokio::test]
async fn metrics_exposes_pipeline_series() {
    use keyword_notifier::channel::LogBroker;
    use keyword_notifier::metrics::Metrics;
    use keyword_notifier::model::Article;
    use keyword_notifier::Publisher;
    use std::sync::Arc;
    use std::time::Duration;

    let metrics = Metrics::init().expect("recorder installs once");
    let broker = LogBroker::in_memory(2);
    let publisher = Publisher::new(Arc::new(broker), "notifications", Duration::from_secs(1));
    publisher
        .publish(7, "bitcoin", &Article::default())
        .await
        .unwrap();

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("publisher_envelopes_total"), "got:\n{text}");
}
