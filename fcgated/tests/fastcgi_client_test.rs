mod common;

use common::{MockBackend, Reply};
use fcgated::fastcgi::{
    Client, ClientSettings, FastCgiError, FastCgiRequest, Params, UpstreamAddr,
};
use fcgated::transport::into_http_response;
use hyper::{Body, Method};
use std::time::{Duration, Instant};

fn settings(max_conns: usize) -> ClientSettings {
    ClientSettings {
        dial_timeout: Duration::from_secs(2),
        write_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(2),
        acquire_timeout: Duration::from_millis(200),
        max_conns,
        log_stderr: true,
    }
}

fn client_for(backend: &MockBackend, settings: ClientSettings) -> Client {
    let addr = UpstreamAddr::parse(&backend.address()).expect("upstream address");
    Client::new(addr, settings)
}

fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.as_bytes().to_vec(), v.as_bytes().to_vec()))
        .collect()
}

fn get(pairs: &[(&str, &str)]) -> FastCgiRequest {
    FastCgiRequest::responder(Method::GET, params(pairs), Body::empty())
}

#[tokio::test]
async fn drained_response_returns_connection_for_reuse() {
    let backend = MockBackend::fixed("Content-Type: text/plain\r\n\r\nhello").await;
    let client = client_for(&backend, settings(2));

    let mut first = client
        .execute(get(&[("SCRIPT_NAME", "/a.php")]))
        .await
        .expect("execute");
    let body = first.read_to_end().await.expect("read");
    assert_eq!(&body[..], b"Content-Type: text/plain\r\n\r\nhello");
    assert!(first.is_drained());
    drop(first);
    assert_eq!(client.pool().idle(), 1);
    assert_eq!(client.pool().live(), 1);

    let mut second = client
        .execute(get(&[("SCRIPT_NAME", "/b.php")]))
        .await
        .expect("execute");
    second.read_to_end().await.expect("read");
    drop(second);

    assert_eq!(backend.accepted(), 1);
    let requests = backend.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].request_id, requests[1].request_id);
    assert_ne!(requests[0].request_id, 0);
    assert!(requests[0].keep_conn);
    assert_eq!(requests[0].role, 1);
    assert_eq!(requests[1].param("SCRIPT_NAME").as_deref(), Some("/b.php"));
}

#[tokio::test]
async fn abandoned_response_closes_connection() {
    let backend = MockBackend::fixed("\r\nbody").await;
    let client = client_for(&backend, settings(2));

    let response = client.execute(get(&[])).await.expect("execute");
    assert_eq!(client.pool().live(), 1);
    drop(response);
    assert_eq!(client.pool().live(), 0);
    assert_eq!(client.pool().idle(), 0);

    let mut next = client.execute(get(&[])).await.expect("execute");
    assert_eq!(&next.read_to_end().await.expect("read")[..], b"\r\nbody");
    drop(next);
    assert_eq!(backend.accepted(), 2);
}

#[tokio::test]
async fn dropped_downstream_body_closes_connection() {
    let backend = MockBackend::start(|_| {
        Reply::chunks(&[
            "Content-Type: text/plain\r\n\r\nfirst",
            "second",
            "third",
            "fourth",
        ])
    })
    .await;
    let client = client_for(&backend, settings(1));

    let stdout = client.execute(get(&[])).await.expect("execute");
    let response = into_http_response(stdout).await.expect("response");
    assert_eq!(response.status(), 200);
    drop(response);

    let deadline = Instant::now() + Duration::from_secs(2);
    while client.pool().live() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(client.pool().live(), 0);
    assert_eq!(client.pool().idle(), 0);

    let mut next = client.execute(get(&[])).await.expect("execute");
    next.read_to_end().await.expect("read");
    drop(next);
    assert_eq!(backend.accepted(), 2);
}

#[tokio::test]
async fn incomplete_end_request_is_an_error_and_not_pooled() {
    let backend = MockBackend::start(|_| Reply::cgi("\r\n").with_protocol_status(2)).await;
    let client = client_for(&backend, settings(2));

    let mut response = client.execute(get(&[])).await.expect("execute");
    let err = response.read_to_end().await.expect_err("overloaded");
    assert!(matches!(
        err,
        FastCgiError::EndRequestNotComplete {
            protocol_status: 2,
            ..
        }
    ));
    drop(response);
    assert_eq!(client.pool().live(), 0);
    assert_eq!(client.pool().idle(), 0);
}

#[tokio::test]
async fn stdout_is_reassembled_and_stderr_collected() {
    let backend = MockBackend::start(|_| {
        Reply::chunks(&["Status: 201 Created\r\n", "", "\r\nfirst ", "second"])
            .with_stderr("PHP Notice: undefined index")
    })
    .await;
    let client = client_for(&backend, settings(1));

    let mut response = client.execute(get(&[])).await.expect("execute");
    let body = response.read_to_end().await.expect("read");
    assert_eq!(&body[..], b"Status: 201 Created\r\n\r\nfirst second");
    assert_eq!(response.stderr(), b"PHP Notice: undefined index");
}

#[tokio::test]
async fn response_for_another_request_id_is_rejected() {
    let backend = MockBackend::start(|req| {
        Reply::cgi("\r\n").with_request_id(req.request_id.wrapping_add(7))
    })
    .await;
    let client = client_for(&backend, settings(1));

    let mut response = client.execute(get(&[])).await.expect("execute");
    let err = response.read_to_end().await.expect_err("mismatched id");
    assert!(matches!(err, FastCgiError::UnexpectedRequestId { .. }));
    assert!(err.is_protocol());
    drop(response);
    assert_eq!(client.pool().live(), 0);
}

#[tokio::test]
async fn large_body_and_params_arrive_intact() {
    let backend = MockBackend::fixed("\r\n").await;
    let client = client_for(&backend, settings(1));

    let body: Vec<u8> = (0..150_000u32).map(|i| (i % 251) as u8).collect();
    let big_value = "v".repeat(70_000);
    let request = FastCgiRequest::responder(
        Method::POST,
        params(&[
            ("REQUEST_METHOD", "POST"),
            ("CONTENT_LENGTH", "150000"),
            ("HTTP_X_LARGE", big_value.as_str()),
        ]),
        Body::from(body.clone()),
    );
    let mut response = client.execute(request).await.expect("execute");
    response.read_to_end().await.expect("read");
    drop(response);

    let requests = backend.requests();
    let seen = &requests[0];
    assert_eq!(seen.stdin_record_lens, vec![65_535, 65_535, 18_930]);
    assert_eq!(seen.stdin, body);
    assert_eq!(seen.param("HTTP_X_LARGE").map(|v| v.len()), Some(70_000));
    assert_eq!(seen.param("CONTENT_LENGTH").as_deref(), Some("150000"));
    assert!(seen.param_record_lens.len() >= 2);
    assert!(seen.param_record_lens.iter().all(|len| *len <= 65_535));
}

#[tokio::test]
async fn saturated_pool_times_out_acquire() {
    let backend = MockBackend::fixed("\r\n").await;
    let client = client_for(&backend, settings(2));

    let held_a = client.execute(get(&[])).await.expect("first");
    let held_b = client.execute(get(&[])).await.expect("second");
    let started = Instant::now();
    let err = client
        .execute(get(&[]))
        .await
        .err()
        .expect("third must wait for a slot");
    assert!(matches!(err, FastCgiError::AcquireTimeout(..)));
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(client.pool().live(), 2);
    drop((held_a, held_b));
    assert_eq!(client.pool().live(), 0);
}

#[tokio::test]
async fn slow_backend_hits_read_timeout() {
    let backend =
        MockBackend::start(|_| Reply::cgi("\r\nlate").delayed(Duration::from_secs(2))).await;
    let mut tight = settings(1);
    tight.read_timeout = Duration::from_millis(150);
    let client = client_for(&backend, tight);

    let mut response = client.execute(get(&[])).await.expect("execute");
    let err = response.read_to_end().await.expect_err("timeout");
    assert!(matches!(err, FastCgiError::ReadTimeout));
    assert!(err.is_timeout());
    drop(response);
    assert_eq!(client.pool().live(), 0);
}
