//! Worker HTTP runtime served in-process with injected handlers.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use prefork_server::app::{Handler, HandlerError, Request, Response};
use prefork_server::worker::heartbeat::Heartbeat;
use prefork_server::worker::runtime;
use prefork_server::Result;

struct TestWorker {
    addr: SocketAddr,
    beats: mpsc::UnboundedReceiver<Heartbeat>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

async fn start(handler: Arc<dyn Handler>, max_body_bytes: usize) -> TestWorker {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    let (tx, beats) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(runtime::serve(
        listener,
        handler,
        tx,
        max_body_bytes,
        shutdown.clone(),
    ));
    TestWorker {
        addr,
        beats,
        shutdown,
        task,
    }
}

fn ok_handler() -> Arc<dyn Handler> {
    Arc::new(|req: Request| -> std::result::Result<Response, HandlerError> {
        Ok(Response::new(200).with_body(format!("{} {}", req.method, req.path)))
    })
}

#[tokio::test]
async fn serves_request_and_closes_connection() {
    let worker = start(ok_handler(), 1024).await;

    let response = reqwest::get(format!("http://{}/hello", worker.addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response
            .headers()
            .get("connection")
            .and_then(|v| v.to_str().ok()),
        Some("close")
    );
    assert_eq!(response.text().await.expect("body"), "GET /hello");

    worker.shutdown.cancel();
    worker.task.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn each_request_is_bracketed_by_heartbeats() {
    let mut worker = start(ok_handler(), 1024).await;

    for _ in 0..2 {
        reqwest::get(format!("http://{}/", worker.addr))
            .await
            .expect("request");
    }

    let mut seen = Vec::new();
    for _ in 0..4 {
        let beat = tokio::time::timeout(Duration::from_secs(2), worker.beats.recv())
            .await
            .expect("heartbeat in time")
            .expect("channel open");
        seen.push(beat);
    }
    assert_eq!(
        seen,
        vec![
            Heartbeat::Busy,
            Heartbeat::Idle,
            Heartbeat::Busy,
            Heartbeat::Idle
        ]
    );

    worker.shutdown.cancel();
    worker.task.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn handler_error_becomes_generic_500() {
    let failing: Arc<dyn Handler> =
        Arc::new(|_req: Request| -> std::result::Result<Response, HandlerError> {
            Err(HandlerError::new("database password is hunter2"))
        });
    let worker = start(failing, 1024).await;

    let response = reqwest::get(format!("http://{}/", worker.addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 500);
    let body = response.text().await.expect("body");
    assert!(!body.contains("hunter2"), "detail leaked: {body}");
    assert!(body.contains("Internal Server Error"));

    // The worker keeps serving after a failed request.
    let again = reqwest::get(format!("http://{}/", worker.addr))
        .await
        .expect("second request");
    assert_eq!(again.status(), 500);

    worker.shutdown.cancel();
    worker.task.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn handler_panic_becomes_generic_500() {
    let panicking: Arc<dyn Handler> =
        Arc::new(|_req: Request| -> std::result::Result<Response, HandlerError> {
            panic!("handler exploded")
        });
    let worker = start(panicking, 1024).await;

    let response = reqwest::get(format!("http://{}/", worker.addr))
        .await
        .expect("request");
    assert_eq!(response.status(), 500);

    worker.shutdown.cancel();
    worker.task.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let worker = start(ok_handler(), 8).await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/upload", worker.addr))
        .body(vec![b'a'; 64])
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 413);

    worker.shutdown.cancel();
    worker.task.await.expect("join").expect("clean exit");
}

#[tokio::test]
async fn shutdown_lets_in_flight_request_finish() {
    let slow: Arc<dyn Handler> =
        Arc::new(|_req: Request| -> std::result::Result<Response, HandlerError> {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Response::new(200).with_body("done"))
        });
    let mut worker = start(slow, 1024).await;

    let url = format!("http://{}/", worker.addr);
    let in_flight = tokio::spawn(async move { reqwest::get(url).await });

    let first = tokio::time::timeout(Duration::from_secs(2), worker.beats.recv())
        .await
        .expect("busy in time");
    assert_eq!(first, Some(Heartbeat::Busy));
    worker.shutdown.cancel();

    let response = in_flight.await.expect("join").expect("request completes");
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.expect("body"), "done");
    worker.task.await.expect("join").expect("clean exit");
}
