//! Requests relayed through the supervisor to worker processes.

use std::time::Duration;

use prefork_server::supervisor::WorkerState;

use super::test_helpers::{client, pids, start_server, test_config, url, wait_until};

#[tokio::test(flavor = "multi_thread")]
async fn pool_boots_configured_worker_count() {
    let config = test_config("hello", 2, 30);
    let server = start_server(&config).await;

    let workers = server.workers();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].slot, 0);
    assert_eq!(workers[1].slot, 1);
    assert!(workers.iter().all(|w| w.state == WorkerState::Idle));
    assert_ne!(workers[0].pid, workers[1].pid);

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn hello_app_answers_through_the_pool() {
    let config = test_config("hello", 2, 30);
    let server = start_server(&config).await;

    let response = client()
        .get(url(&server, "/"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["status"], "success");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_app_sees_method_path_and_body() {
    let config = test_config("echo", 1, 30);
    let server = start_server(&config).await;

    let response = client()
        .post(url(&server, "/items?id=7"))
        .body("payload")
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["method"], "POST");
    assert_eq!(body["path"], "/items");
    assert_eq!(body["query"], "id=7");
    assert_eq!(body["body"], "payload");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn connections_queue_while_every_worker_is_busy() {
    let config = test_config("sleep", 2, 30);
    let server = start_server(&config).await;
    let http = client();

    let requests = (0..4).map(|_| {
        let http = http.clone();
        let target = url(&server, "/?ms=300");
        async move { http.get(target).send().await }
    });
    for response in futures_util::future::join_all(requests).await {
        assert_eq!(response.expect("request").status(), 200);
    }

    let all_counted = wait_until(Duration::from_secs(5), || {
        server
            .workers()
            .iter()
            .map(|w| w.requests_served)
            .sum::<u64>()
            == 4
    })
    .await;
    assert!(all_counted, "every request should be counted once");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn handler_failure_returns_500_and_keeps_worker() {
    let config = test_config("fail", 1, 30);
    let server = start_server(&config).await;
    let before = pids(&server);

    for _ in 0..2 {
        let response = client()
            .get(url(&server, "/"))
            .send()
            .await
            .expect("request");
        assert_eq!(response.status(), 500);
        let body: serde_json::Value = response.json().await.expect("json body");
        assert_eq!(
            body,
            serde_json::json!({"status": "error", "message": "Internal Server Error"})
        );
    }

    assert_eq!(pids(&server), before, "failed requests must not kill workers");
    server.shutdown(Duration::from_secs(5)).await;
}
