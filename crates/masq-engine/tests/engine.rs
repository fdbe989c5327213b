//! End-to-end engine tests: stub matching, round-robin, proxy recording,
//! and behavior post-processing against a local origin server.

use masq_engine::{
    EngineError, Imposter, ImposterConfig, NormalizedRequest, StubOperation,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal canned-response origin for proxy tests. Counts connections (one
/// request per connection) and records observed Host headers.
struct Origin {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    hosts: Arc<Mutex<Vec<String>>>,
}

impl Origin {
    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn observed_hosts(&self) -> Vec<String> {
        self.hosts.lock().unwrap().clone()
    }
}

async fn spawn_origin(status: u16, content_type: &str, body: Vec<u8>) -> Origin {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hosts = Arc::new(Mutex::new(Vec::new()));

    let task_hits = hits.clone();
    let task_hosts = hosts.clone();
    let content_type = content_type.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            task_hits.fetch_add(1, Ordering::SeqCst);

            let mut buf = Vec::new();
            let mut tmp = [0u8; 1024];
            loop {
                let n = socket.read(&mut tmp).await.unwrap_or(0);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&tmp[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&buf).to_string();
            if let Some(host) = head
                .lines()
                .find(|l| l.to_ascii_lowercase().starts_with("host:"))
                .map(|l| l[5..].trim().to_string())
            {
                task_hosts.lock().unwrap().push(host);
            }

            let response = format!(
                "HTTP/1.1 {status} OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });

    Origin { addr, hits, hosts }
}

fn imposter(json: serde_json::Value) -> Imposter {
    let config: ImposterConfig = serde_json::from_value(json).unwrap();
    Imposter::new(config).unwrap()
}

#[tokio::test]
async fn test_overlapping_predicates_make_later_stub_unreachable() {
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [
            {
                "predicates": [{"equals": {"path": "/only-first"}}],
                "responses": [{"is": {"body": "one"}}]
            },
            {
                "predicates": [{"startsWith": {"path": "/shared"}}],
                "responses": [{"is": {"body": "two"}}]
            },
            {
                "predicates": [{"startsWith": {"path": "/shared"}}],
                "responses": [{"is": {"body": "three"}}]
            }
        ]
    }));

    for _ in 0..5 {
        let response = imposter
            .handle(NormalizedRequest::new(Some("GET"), "/shared/thing"))
            .await
            .unwrap();
        assert_eq!(response.body.as_deref(), Some("two"));
    }

    // Stub 3 shares stub 2's predicates and is registered later, so it is
    // provably unreachable.
    assert_eq!(imposter.match_counts(), vec![0, 5, 0]);
}

#[tokio::test]
async fn test_proxy_once_records_and_replays_without_reinvoking_origin() {
    let origin = spawn_origin(200, "text/plain", b"from origin".to_vec()).await;
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": origin.url(), "mode": "proxyOnce"}}]
        }]
    }));

    let request = NormalizedRequest::new(Some("GET"), "/widgets").with_query("id", "7");

    let first = imposter.handle(request.clone()).await.unwrap();
    assert_eq!(first.status_code, 200);
    assert_eq!(first.body.as_deref(), Some("from origin"));
    assert!(first.proxy_response_time_ms.is_some());
    assert_eq!(origin.hits(), 1);

    // Exactly one recorded stub, inserted ahead of the proxy stub.
    assert_eq!(imposter.stub_count(), 2);

    // A predicate-identical request replays the recording.
    let second = imposter.handle(request.clone()).await.unwrap();
    assert_eq!(second.body.as_deref(), Some("from origin"));
    assert_eq!(origin.hits(), 1);
    assert_eq!(imposter.stub_count(), 2);

    // A different request falls through to the proxy again.
    let other = NormalizedRequest::new(Some("GET"), "/gadgets");
    imposter.handle(other).await.unwrap();
    assert_eq!(origin.hits(), 2);
    assert_eq!(imposter.stub_count(), 3);
}

#[tokio::test]
async fn test_proxy_transparent_never_records() {
    let origin = spawn_origin(200, "text/plain", b"pass through".to_vec()).await;
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": origin.url(), "mode": "proxyTransparent"}}]
        }]
    }));

    let request = NormalizedRequest::new(Some("GET"), "/");
    imposter.handle(request.clone()).await.unwrap();
    imposter.handle(request).await.unwrap();
    assert_eq!(origin.hits(), 2);
    assert_eq!(imposter.stub_count(), 1);
}

#[tokio::test]
async fn test_proxy_binary_response_round_trips_exactly() {
    let origin = spawn_origin(200, "image/gif", vec![0, 1, 2, 3]).await;
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": origin.url(), "mode": "proxyOnce"}}]
        }]
    }));

    let request = NormalizedRequest::new(Some("GET"), "/logo.gif");
    let first = imposter.handle(request.clone()).await.unwrap();
    assert_eq!(first.body.as_deref(), Some("AAECAw=="));
    assert_eq!(first.mode, masq_engine::BodyMode::Binary);
    assert_eq!(first.body_bytes(), Some(vec![0, 1, 2, 3]));

    // The recorded stub re-delivers identical base64 text and binary flag.
    let replayed = imposter.handle(request).await.unwrap();
    assert_eq!(replayed.body.as_deref(), Some("AAECAw=="));
    assert_eq!(replayed.mode, masq_engine::BodyMode::Binary);
    assert_eq!(origin.hits(), 1);
}

#[tokio::test]
async fn test_proxy_rewrites_host_header_to_target() {
    let origin = spawn_origin(200, "text/plain", b"ok".to_vec()).await;
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": origin.url(), "mode": "proxyTransparent"}}]
        }]
    }));

    let request =
        NormalizedRequest::new(Some("GET"), "/").with_header("host", "virtual.example.com");
    imposter.handle(request).await.unwrap();

    let hosts = origin.observed_hosts();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0], origin.addr.to_string());
    assert_ne!(hosts[0], "virtual.example.com");
}

#[tokio::test]
async fn test_proxy_error_mapping() {
    let unresolvable = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": "http://host.that.cannot.possibly.resolve.invalid"}}]
        }]
    }));
    let err = unresolvable
        .handle(NormalizedRequest::new(Some("GET"), "/"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid proxy");
    assert_eq!(
        err.to_string(),
        "Cannot resolve \"http://host.that.cannot.possibly.resolve.invalid\""
    );
    // A failed proxy leaves nothing recorded.
    assert_eq!(unresolvable.stub_count(), 1);
    assert_eq!(unresolvable.match_counts(), vec![0]);

    let unparsable = imposter(serde_json::json!({
        "port": 3001,
        "stubs": [{
            "responses": [{"proxy": {"to": "not an address"}}]
        }]
    }));
    let err = unparsable
        .handle(NormalizedRequest::new(Some("GET"), "/"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid proxy");
    assert_eq!(err.to_string(), "Unable to connect to \"not an address\"");
}

#[tokio::test]
async fn test_proxy_timeout_maps_to_dedicated_error() {
    // Origin that reads the request and then stalls well past the timeout.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut tmp = [0u8; 1024];
                let _ = socket.read(&mut tmp).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
                    .await;
            });
        }
    });

    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": format!("http://{addr}"), "timeoutMs": 100}}]
        }]
    }));

    let err = imposter
        .handle(NormalizedRequest::new(Some("GET"), "/"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid proxy");
    assert!(
        matches!(err, EngineError::ProxyTimeout { timeout_ms: 100, .. }),
        "expected timeout error, got: {err}"
    );
    // The timed-out exchange records nothing.
    assert_eq!(imposter.stub_count(), 1);
    assert_eq!(imposter.match_counts(), vec![0]);
}

#[tokio::test]
async fn test_wait_behavior_delays_but_does_not_inflate_proxy_timing() {
    let origin = spawn_origin(200, "text/plain", b"timed".to_vec()).await;
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [{"proxy": {"to": origin.url(), "mode": "proxyTransparent"}}],
            "_behaviors": [{"wait": 200}]
        }]
    }));

    let start = Instant::now();
    let response = imposter
        .handle(NormalizedRequest::new(Some("GET"), "/"))
        .await
        .unwrap();
    let elapsed = start.elapsed().as_millis() as u64;

    assert!(elapsed >= 200, "wait behavior not observed: {elapsed}ms");
    // Proxy timing reflects only the round trip, captured before behaviors.
    let proxy_ms = response.proxy_response_time_ms.unwrap();
    assert!(proxy_ms < 200, "proxy timing inflated by wait: {proxy_ms}ms");
}

#[tokio::test]
async fn test_inject_end_to_end_with_injection_enabled() {
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "allowInjection": true,
        "stubs": [{
            "predicates": [{"equals": {"path": "/greet"}}],
            "responses": [{"inject": "#{ statusCode: 200, body: `hello ` + request.query.name }"}]
        }]
    }));

    let request = NormalizedRequest::new(Some("GET"), "/greet").with_query("name", "bob");
    let response = imposter.handle(request).await.unwrap();
    assert_eq!(response.body.as_deref(), Some("hello bob"));
}

#[tokio::test]
async fn test_runtime_stub_edit_changes_matching() {
    let imposter = imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "predicates": [{"equals": {"path": "/a"}}],
            "responses": [{"is": {"body": "old"}}]
        }]
    }));

    let replacement = serde_json::from_value(serde_json::json!({
        "predicates": [{"equals": {"path": "/a"}}],
        "responses": [{"is": {"body": "new"}}]
    }))
    .unwrap();
    imposter
        .mutate_stubs(StubOperation::Replace {
            index: 0,
            stub: replacement,
        })
        .unwrap();

    let response = imposter
        .handle(NormalizedRequest::new(Some("GET"), "/a"))
        .await
        .unwrap();
    assert_eq!(response.body.as_deref(), Some("new"));

    let err = imposter
        .mutate_stubs(StubOperation::Remove { index: 9 })
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidStubIndex(9)));
}

#[tokio::test]
async fn test_concurrent_requests_receive_distinct_round_robin_indices() {
    let imposter = Arc::new(imposter(serde_json::json!({
        "port": 3000,
        "stubs": [{
            "responses": [
                {"is": {"body": "0"}},
                {"is": {"body": "1"}},
                {"is": {"body": "2"}},
                {"is": {"body": "3"}}
            ]
        }]
    })));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let imposter = imposter.clone();
        handles.push(tokio::spawn(async move {
            imposter
                .handle(NormalizedRequest::new(Some("GET"), "/"))
                .await
                .unwrap()
                .body
                .unwrap()
        }));
    }

    let mut bodies: Vec<String> = Vec::new();
    for handle in handles {
        bodies.push(handle.await.unwrap());
    }
    bodies.sort();
    // No duplicate or skipped index.
    assert_eq!(bodies, vec!["0", "1", "2", "3"]);
    assert_eq!(imposter.match_counts(), vec![4]);
}
