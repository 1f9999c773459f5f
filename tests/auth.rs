mod support;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use support::server;

#[tokio::test]
async fn test_basic_challenge_flow() {
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();

    let server = server::http(move |req| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            match req.headers().get("authorization") {
                None => {
                    assert_eq!(n, 0, "only the first request may lack credentials");
                    http::Response::builder()
                        .status(http::StatusCode::UNAUTHORIZED)
                        .header("www-authenticate", "Basic realm=\"x\"")
                        .body(server::empty())
                        .unwrap()
                }
                Some(value) => {
                    assert_eq!(value, "Basic dXNlcjpwYXNz");
                    http::Response::new(server::body("welcome"))
                }
            }
        }
    });

    let res = courier::Client::new()
        .get(format!("http://{}/protected", server.addr()))
        .auth(courier::BasicChallengeAuth::new("user", Some("pass")))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), courier::StatusCode::OK);
    // The 401 exchange is recorded in the history.
    assert_eq!(res.history().len(), 1);
    assert_eq!(
        res.history()[0].status(),
        courier::StatusCode::UNAUTHORIZED
    );
    assert_eq!(res.text().await.unwrap(), "welcome");
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_basic_auth_sends_credentials_up_front() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["authorization"], "Basic dXNlcjpwYXNz");
        http::Response::new(server::empty())
    });

    let res = courier::Client::builder()
        .auth(courier::BasicAuth::new("user", Some("pass")))
        .build()
        .unwrap()
        .get(format!("http://{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn test_function_auth_decorates_request() {
    let server = server::http(move |req| async move {
        assert_eq!(req.headers()["x-api-key"], "s3cret");
        http::Response::new(server::empty())
    });

    let auth = courier::FunctionAuth::new(|mut request: courier::Request| {
        request
            .headers_mut()
            .insert("x-api-key", http::HeaderValue::from_static("s3cret"));
        Ok(request)
    });

    let res = courier::Client::new()
        .get(format!("http://{}/", server.addr()))
        .auth(auth)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}

#[tokio::test]
async fn test_challenge_auth_replays_buffered_body() {
    use http_body_util::BodyExt;

    let server = server::http(move |req| async move {
        let authorized = req.headers().contains_key("authorization");
        let full = req.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(full, "upload twice");
        if authorized {
            http::Response::new(server::body("stored"))
        } else {
            http::Response::builder()
                .status(http::StatusCode::UNAUTHORIZED)
                .header("www-authenticate", "Basic realm=\"x\"")
                .body(server::empty())
                .unwrap()
        }
    });

    // A streaming body would normally be one-shot; requires_request_body
    // buffers it so the challenge retry can replay it.
    let chunks: Vec<Result<_, std::io::Error>> = vec![Ok("upload "), Ok("twice")];
    let body = courier::Body::wrap_stream(futures_util::stream::iter(chunks));

    let res = courier::Client::new()
        .post(format!("http://{}/upload", server.addr()))
        .body(body)
        .auth(courier::BasicChallengeAuth::new("user", Some("pass")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "stored");
}

#[tokio::test]
async fn test_url_userinfo_becomes_basic_auth() {
    let server = server::http(move |req| async move {
        let auth = req.headers()["authorization"].to_str().unwrap().to_owned();
        assert!(auth.starts_with("Basic "), "{auth}");
        http::Response::new(server::empty())
    });

    let res = courier::Client::new()
        .get(format!("http://user:pw@{}/", server.addr()))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), courier::StatusCode::OK);
}
