mod common;

use std::ops::ControlFlow;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;

use k8_client::K8Watch;
use k8_client::ObjectMeta;
use k8_client::WatchOptions;
use k8_client::WatchStream;

use common::MockServer;
use common::Reply;
use common::error_event;
use common::event;
use common::init_tracing;

const PODS: &str = "/api/v1/namespaces/default/pods";

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
}

fn fast_options() -> WatchOptions {
    WatchOptions {
        backoff_floor: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(20),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_reconnect_resumes_from_last_version() {
    let server = MockServer::start(vec![
        Reply::Lines(vec![
            event("ADDED", "a", "10"),
            event("MODIFIED", "a", "11"),
            event("MODIFIED", "a", "12"),
        ]),
        Reply::Lines(vec![error_event(500)]),
    ])
    .await;

    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    let mut versions = vec![];
    while let Some(event) = stream.next().await {
        versions.push(event.expect("event").into_object().metadata.resource_version);
    }
    assert_eq!(versions, vec!["10", "11", "12"]);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].path(), PODS);
    assert_eq!(requests[0].query("watch").as_deref(), Some("1"));
    assert_eq!(requests[0].query("resourceVersion"), None);
    assert_eq!(requests[1].query("resourceVersion").as_deref(), Some("12"));
    assert_eq!(
        requests[1].header("authorization"),
        Some("Bearer test-token")
    );
}

#[tokio::test]
async fn test_gone_restarts_from_zero() {
    let server = MockServer::start(vec![
        Reply::status(410),
        Reply::Lines(vec![error_event(500)]),
    ])
    .await;

    let options = WatchOptions {
        resource_version: Some("7".to_owned()),
        ..fast_options()
    };
    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, options);
    assert!(stream.next().await.is_none());

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].query("resourceVersion").as_deref(), Some("7"));
    assert_eq!(requests[1].query("resourceVersion").as_deref(), Some("0"));
}

#[tokio::test]
async fn test_single_event_then_gone() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start(vec![
        Reply::Lines(vec![event("ADDED", "x", "5")]),
        Reply::status(410),
        Reply::Lines(vec![error_event(500)]),
    ])
    .await;

    let stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    let mut names = vec![];
    stream
        .for_each_event(|event| {
            assert!(matches!(event, K8Watch::Added(_)));
            names.push(event.into_object().metadata.name);
            ControlFlow::Continue(())
        })
        .await?;
    assert_eq!(names, vec!["x"]);

    let requests = server.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[1].query("resourceVersion").as_deref(), Some("5"));
    assert_eq!(requests[2].query("resourceVersion").as_deref(), Some("0"));
    Ok(())
}

#[tokio::test]
async fn test_gone_event_in_stream() {
    let server = MockServer::start(vec![
        Reply::Lines(vec![event("ADDED", "a", "3"), error_event(410)]),
        Reply::Lines(vec![error_event(500)]),
    ])
    .await;

    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    assert!(stream.next().await.expect("event").is_ok());
    assert!(stream.next().await.is_none());

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].query("resourceVersion").as_deref(), Some("0"));
}

#[tokio::test]
async fn test_bookmark_moves_cursor() {
    let server = MockServer::start(vec![
        Reply::Lines(vec![event("BOOKMARK", "", "20")]),
        Reply::Lines(vec![error_event(500)]),
    ])
    .await;

    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    assert!(stream.next().await.is_none());

    let requests = server.requests();
    assert_eq!(requests[1].query("resourceVersion").as_deref(), Some("20"));
}

#[tokio::test]
async fn test_auth_failure_stops_watch() {
    let server = MockServer::start(vec![Reply::Json(401, "denied".to_owned())]).await;

    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    let err = stream.next().await.expect("item").expect_err("auth error");
    assert!(err.is_auth());
    assert!(err.to_string().contains("denied"));
    assert!(stream.next().await.is_none());
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let server = MockServer::start(vec![Reply::status(500)]).await;

    let options = WatchOptions {
        max_retries: 2,
        ..fast_options()
    };
    let stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, options);
    let err = stream
        .for_each_event(|_| ControlFlow::Continue(()))
        .await
        .expect_err("gave up");
    assert!(matches!(
        err,
        k8_client::ClientError::RetriesExhausted { retries: 3, .. }
    ));
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_malformed_line_counts_as_failure() {
    let server = MockServer::start(vec![
        Reply::Lines(vec!["{not json".to_owned()]),
        Reply::Lines(vec![event("ADDED", "b", "8"), error_event(500)]),
    ])
    .await;

    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    let event = stream.next().await.expect("event").expect("ok");
    assert_eq!(event.object().metadata.name, "b");
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_endless_malformed_stream_exhausts_retries() {
    let server = MockServer::start(vec![Reply::Lines(vec!["{not json".to_owned()])]).await;

    let options = WatchOptions {
        max_retries: 2,
        ..fast_options()
    };
    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, options);
    let err = tokio::time::timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("watch gives up")
        .expect("item")
        .expect_err("retries exhausted");
    assert!(matches!(
        err,
        k8_client::ClientError::RetriesExhausted { retries: 3, .. }
    ));
    assert!(stream.next().await.is_none());
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_callback_can_stop_watch() {
    let server = MockServer::start(vec![Reply::Lines(vec![
        event("ADDED", "a", "1"),
        event("ADDED", "b", "2"),
        event("ADDED", "c", "3"),
    ])])
    .await;

    let stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, fast_options());
    let mut seen = 0;
    stream
        .for_each_event(|_| {
            seen += 1;
            ControlFlow::Break(())
        })
        .await
        .expect("stopped");
    assert_eq!(seen, 1);
    assert_eq!(server.requests().len(), 1);
}

#[tokio::test]
async fn test_selectors_and_timeout_in_query() {
    let server = MockServer::start(vec![Reply::Lines(vec![error_event(500)])]).await;

    let options = WatchOptions {
        label_selector: Some("app".to_owned()),
        timeout_seconds: Some(60),
        ..fast_options()
    };
    let mut stream: WatchStream<Pod> = WatchStream::new(server.manager().await, PODS, options);
    assert!(stream.next().await.is_none());

    let request = &server.requests()[0];
    assert_eq!(request.query("labelSelector").as_deref(), Some("app"));
    assert_eq!(request.query("timeoutSeconds").as_deref(), Some("60"));
    assert_eq!(request.query("limit"), None);
}
