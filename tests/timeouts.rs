mod support;

use std::time::{Duration, Instant};

use support::server;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn test_read_timeout_on_response_head() {
    let _ = env_logger::try_init();

    let server = server::low_level_with_response(|_raw, client_socket| {
        Box::new(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = client_socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                .await;
        })
    });

    let start = Instant::now();
    let err = courier::Client::builder()
        .read_timeout(Duration::from_millis(500))
        .build()
        .unwrap()
        .get(format!("http://{}/slow", server.addr()))
        .send()
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(err.is_read_timeout(), "{err:?}");
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "timeout should fire promptly, took {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn test_read_timeout_on_response_body() {
    let server = server::low_level_with_response(|raw, client_socket| {
        let slow = raw.starts_with(b"GET /slow");
        Box::new(async move {
            if slow {
                let _ = client_socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\n")
                    .await;
                tokio::time::sleep(Duration::from_secs(2)).await;
                let _ = client_socket.write_all(b"0123456789").await;
            } else {
                let _ = client_socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\nfast")
                    .await;
            }
        })
    });

    let client = courier::Client::builder()
        .read_timeout(Duration::from_millis(500))
        .build()
        .unwrap();

    // The head arrives fine; the body stalls.
    let start = Instant::now();
    let res = client
        .get(format!("http://{}/slow", server.addr()))
        .send()
        .await
        .unwrap();
    let err = res.text().await.unwrap_err();
    assert!(err.is_read_timeout(), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(1));

    // The timed-out connection was removed from the pool; the next
    // request dials a fresh one and succeeds.
    let text = client
        .get(format!("http://{}/fast", server.addr()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(text, "fast");
    assert_eq!(server.accepted(), 2);
}

#[tokio::test]
async fn test_connect_timeout() {
    // RFC 5737 TEST-NET-1: unroutable, the dial can only time out.
    let err = courier::Client::builder()
        .connect_timeout(Duration::from_millis(200))
        .build()
        .unwrap()
        .get("http://192.0.2.1:81/")
        .send()
        .await
        .unwrap_err();

    assert!(err.is_timeout() || err.is_connect(), "{err:?}");
}

#[tokio::test]
async fn test_per_request_timeout_overrides_client() {
    let server = server::low_level_with_response(|_raw, client_socket| {
        Box::new(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            let _ = client_socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
        })
    });

    // Client allows 30s, the request itself only 300ms.
    let start = Instant::now();
    let err = courier::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap()
        .get(format!("http://{}/slow", server.addr()))
        .timeout(Duration::from_millis(300))
        .send()
        .await
        .unwrap_err();

    assert!(err.is_read_timeout(), "{err:?}");
    assert!(start.elapsed() < Duration::from_secs(1));
}
