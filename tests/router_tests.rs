//! Integration tests for the request/response router
//! Local dispatch, remote rendezvous between two attachments, timeouts,
//! handler failures, and streaming responses

use std::sync::{Arc, Mutex};
use std::time::Duration;

use mvent::{HttpRouter, MventError, PoolConfig, SharedPool, Value};
use tempfile::TempDir;

fn open_pool(dir: &TempDir, name: &str) -> SharedPool {
    SharedPool::open(
        PoolConfig::new(name)
            .with_directory(dir.path())
            .with_capacity(64 * 1024)
            .with_poll_interval(Duration::from_millis(25))
            .with_call_timeout(Duration::from_secs(3)),
    )
    .unwrap()
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[cfg(test)]
mod router_tests {
    use super::*;

    /// Test: a local handler answers synchronously
    #[test]
    fn router_local_synchronous_call() {
        let dir = TempDir::new().unwrap();
        let router = HttpRouter::new(open_pool(&dir, "local")).unwrap();

        router
            .route("/greet", |request| {
                let name = request
                    .data
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("stranger");
                Ok(Value::map([("g", Value::from(format!("hi {}", name)))]))
            })
            .unwrap();

        let response = router
            .send_request(
                "/greet",
                "GET",
                Value::map([("name", Value::from("X"))]),
            )
            .unwrap();
        assert_eq!(
            response,
            Value::map([("g", Value::from("hi X"))])
        );
    }

    /// Test: a handler in another attachment answers within the call
    /// timeout
    #[test]
    fn router_remote_rendezvous() {
        let dir = TempDir::new().unwrap();
        let server = HttpRouter::new(open_pool(&dir, "remote")).unwrap();
        let client = HttpRouter::new(open_pool(&dir, "remote")).unwrap();

        server
            .route("/add", |request| {
                let a = request.data.get("a").and_then(Value::as_int).unwrap_or(0);
                let b = request.data.get("b").and_then(Value::as_int).unwrap_or(0);
                Ok(Value::map([("result", Value::Int(a + b))]))
            })
            .unwrap();

        let response = client
            .send_request(
                "/add",
                "POST",
                Value::map([("a", Value::Int(7)), ("b", Value::Int(5))]),
            )
            .unwrap();
        assert_eq!(response, Value::map([("result", Value::Int(12))]));

        server.cleanup().unwrap();
        client.cleanup().unwrap();
    }

    /// Test: no handler anywhere means CallTimeout
    #[test]
    fn router_call_timeout() {
        let dir = TempDir::new().unwrap();
        let pool = SharedPool::open(
            PoolConfig::new("nobody")
                .with_directory(dir.path())
                .with_poll_interval(Duration::from_millis(25))
                .with_call_timeout(Duration::from_millis(300)),
        )
        .unwrap();
        let router = HttpRouter::new(pool).unwrap();

        let started = std::time::Instant::now();
        let err = router
            .send_request("/void", "GET", Value::Null)
            .unwrap_err();
        assert!(matches!(err, MventError::CallTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    /// Test: a remote handler failure surfaces as a handler error
    #[test]
    fn router_remote_handler_failure() {
        let dir = TempDir::new().unwrap();
        let server = HttpRouter::new(open_pool(&dir, "failing")).unwrap();
        let client = HttpRouter::new(open_pool(&dir, "failing")).unwrap();

        server
            .route("/broken", |_request| {
                Err(MventError::handler("backend unavailable"))
            })
            .unwrap();

        let err = client
            .send_request("/broken", "GET", Value::Null)
            .unwrap_err();
        match err {
            MventError::Handler { message } => {
                assert!(message.contains("backend unavailable"));
            }
            other => panic!("expected Handler error, got {}", other),
        }

        server.cleanup().unwrap();
        client.cleanup().unwrap();
    }

    /// Test: a streaming handler feeds chunks through the returned stream
    #[test]
    fn router_streaming_local() {
        let dir = TempDir::new().unwrap();
        let router = HttpRouter::new(open_pool(&dir, "streaming")).unwrap();

        router
            .route("/feed", |request| {
                let stream = request.stream.clone().expect("streaming request");
                // Publish after returning so the caller can subscribe first
                std::thread::spawn(move || {
                    for i in 0..3 {
                        std::thread::sleep(Duration::from_millis(150));
                        let _ = stream.publish(Value::Int(i));
                    }
                });
                Ok(Value::Null)
            })
            .unwrap();

        let stream = router
            .send_request_streaming("/feed", "GET", Value::Null)
            .unwrap();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = stream
            .subscribe(move |chunk| sink.lock().unwrap().push(chunk))
            .unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            seen.lock().unwrap().len() == 3
        }));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Int(0), Value::Int(1), Value::Int(2)]
        );

        router.cleanup().unwrap();
    }

    /// Test: streaming across two attachments
    #[test]
    fn router_streaming_remote() {
        let dir = TempDir::new().unwrap();
        let server = HttpRouter::new(open_pool(&dir, "rstream")).unwrap();
        let client = HttpRouter::new(open_pool(&dir, "rstream")).unwrap();

        server
            .route("/ticks", |request| {
                let stream = request.stream.clone().expect("streaming request");
                std::thread::spawn(move || {
                    for i in 0..3 {
                        std::thread::sleep(Duration::from_millis(150));
                        let _ = stream.publish(Value::Int(i * 10));
                    }
                });
                Ok(Value::Null)
            })
            .unwrap();

        let stream = client
            .send_request_streaming("/ticks", "GET", Value::Null)
            .unwrap();
        let seen: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = stream
            .subscribe(move |chunk| sink.lock().unwrap().push(chunk))
            .unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            seen.lock().unwrap().len() == 3
        }));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Value::Int(0), Value::Int(10), Value::Int(20)]
        );

        server.cleanup().unwrap();
        client.cleanup().unwrap();
    }

    /// Test: the request record lands in the pool with its TTL
    #[test]
    fn router_request_record_has_ttl() {
        let dir = TempDir::new().unwrap();
        let pool = SharedPool::open(
            PoolConfig::new("records")
                .with_directory(dir.path())
                .with_poll_interval(Duration::from_millis(25))
                .with_call_timeout(Duration::from_millis(200))
                .with_request_ttl(Duration::from_secs(30)),
        )
        .unwrap();
        let router = HttpRouter::new(pool.clone()).unwrap();

        let _ = router.send_request("/orphan", "GET", Value::Int(1));

        let snapshot = pool.snapshot().unwrap();
        let request_key = snapshot
            .keys()
            .find(|k| k.starts_with("req/orphan/"))
            .expect("request record written");
        let (_, meta) = pool.get_with_meta(request_key).unwrap().unwrap();
        assert_eq!(meta.ttl_ns, Duration::from_secs(30).as_nanos() as u64);
    }
}
