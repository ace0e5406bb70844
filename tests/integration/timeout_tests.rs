//! Per-request timeout enforcement.

use std::time::{Duration, Instant};

use super::test_helpers::{client, pids, start_server, test_config, url, wait_until};

#[tokio::test(flavor = "multi_thread")]
async fn hung_request_kills_and_replaces_worker() {
    let config = test_config("sleep", 2, 1);
    let server = start_server(&config).await;
    let before = pids(&server);

    let started = Instant::now();
    let outcome = client()
        .get(url(&server, "/?ms=30000"))
        .timeout(Duration::from_secs(20))
        .send()
        .await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(response) => panic!("hung request answered with {}", response.status()),
        Err(err) => assert!(!err.is_timeout(), "client gave up first: {err}"),
    }
    assert!(
        elapsed >= Duration::from_secs(1),
        "killed before the timeout: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(10),
        "kill took too long: {elapsed:?}"
    );

    let replaced = wait_until(Duration::from_secs(10), || {
        let now = pids(&server);
        now.len() == 2 && now != before
    })
    .await;
    assert!(replaced, "killed worker was not replaced");

    let response = client()
        .get(url(&server, "/?ms=10"))
        .send()
        .await
        .expect("pool serves after the kill");
    assert_eq!(response.status(), 200);

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_within_timeout_is_not_killed() {
    let config = test_config("sleep", 1, 2);
    let server = start_server(&config).await;
    let before = pids(&server);

    let response = client()
        .get(url(&server, "/?ms=500"))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.expect("json body");
    assert_eq!(body["slept_ms"], 500);
    assert_eq!(pids(&server), before);

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn idle_workers_are_never_killed() {
    let config = test_config("hello", 2, 1);
    let server = start_server(&config).await;
    let before = pids(&server);

    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert_eq!(pids(&server), before, "idle workers outlived the timeout");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_request_dies_while_fast_ones_succeed() {
    let config = test_config("sleep", 2, 2);
    let server = start_server(&config).await;
    let http = client();

    let slow = {
        let http = http.clone();
        let target = url(&server, "/?ms=10000");
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = http.get(target).send().await;
            (outcome.map(|r| r.status()), started.elapsed())
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let fast = (0..2).map(|_| {
        let http = http.clone();
        let target = url(&server, "/?ms=500");
        async move {
            let started = Instant::now();
            let response = http.get(target).send().await.expect("fast request");
            (response.status(), started.elapsed())
        }
    });
    for (status, elapsed) in futures_util::future::join_all(fast).await {
        assert_eq!(status, 200);
        assert!(elapsed < Duration::from_secs(2), "fast request took {elapsed:?}");
    }

    let (outcome, elapsed) = slow.await.expect("join");
    assert!(outcome.is_err(), "slow request must lose its connection");
    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(8),
        "slow request ended after {elapsed:?}"
    );

    let refilled = wait_until(Duration::from_secs(10), || {
        let workers = server.workers();
        workers.len() == 2
            && workers
                .iter()
                .all(|w| w.state == prefork_server::supervisor::WorkerState::Idle)
    })
    .await;
    assert!(refilled, "pool should be back to two idle workers");

    server.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_client_cannot_pin_a_worker() {
    let config = test_config("hello", 1, 1);
    let server = start_server(&config).await;
    let before = pids(&server);

    let _silent = tokio::net::TcpStream::connect(server.local_addr())
        .await
        .expect("connect");
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let response = client()
        .get(url(&server, "/"))
        .timeout(Duration::from_secs(15))
        .send()
        .await
        .expect("request served once the silent lease times out");
    assert_eq!(response.status(), 200);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "request waited {:?}",
        started.elapsed()
    );
    assert_ne!(pids(&server), before, "pinned worker should be replaced");

    server.shutdown(Duration::from_secs(5)).await;
}
