//! HTTP-like request/response rendezvous over pool keys
//!
//! A cooperative protocol with no dedicated transport: a call writes a
//! TTL-bounded request record to `req/<path>/<uuid>`, and a response
//! arrives at `resp/<path>/<uuid>`. When the calling process itself has
//! a handler for the path it is invoked directly; otherwise any
//! attached process that registered the path observes the request
//! through its watcher and produces the response. Streaming responses
//! flow through a [`StreamChannel`] keyed `resp/<path>/<uuid>/stream`.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex, RwLock};
use std::time::Duration;

use uuid::Uuid;

use crate::error::{MventError, Result};
use crate::pool::SharedPool;
use crate::stream::StreamChannel;
use crate::value::Value;
use crate::watcher::{EventWatcher, Subscription, WeakEventWatcher};

/// A request as seen by a route handler
#[derive(Debug, Clone)]
pub struct Request {
    /// Registered path the request targets
    pub path: String,
    /// Method tag; carried verbatim
    pub method: String,
    /// Request payload
    pub data: Value,
    /// Unique id of this exchange
    pub request_id: String,
    /// Response stream, present in streaming mode
    pub stream: Option<StreamChannel>,
}

/// Handler registered for a path
pub type RouteHandler = Arc<dyn Fn(&Request) -> Result<Value> + Send + Sync>;

/// In-memory request/response router over a shared pool
pub struct HttpRouter {
    /// Distinguishes this router from other responders on the same pool
    id: String,
    pool: SharedPool,
    watcher: EventWatcher,
    routes: Arc<RwLock<HashMap<String, RouteHandler>>>,
    serving: Mutex<HashMap<String, Subscription>>,
    call_timeout: Duration,
    request_ttl: Duration,
}

impl HttpRouter {
    /// Create a router over a pool, starting its own watcher
    ///
    /// Call and request-record timeouts come from the pool configuration.
    pub fn new(pool: SharedPool) -> Result<Self> {
        let watcher = EventWatcher::watch(pool.clone())?;
        let call_timeout = pool.config().call_timeout;
        let request_ttl = pool.config().request_ttl;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            pool,
            watcher,
            routes: Arc::new(RwLock::new(HashMap::new())),
            serving: Mutex::new(HashMap::new()),
            call_timeout,
            request_ttl,
        })
    }

    /// Register a handler for a path
    ///
    /// The handler serves local calls synchronously and remote calls via
    /// the watcher. Registering a path again replaces the handler.
    pub fn route(
        &self,
        path: &str,
        handler: impl Fn(&Request) -> Result<Value> + Send + Sync + 'static,
    ) -> Result<()> {
        self.routes
            .write()
            .unwrap()
            .insert(path.to_string(), Arc::new(handler));

        let mut serving = self.serving.lock().unwrap();
        if serving.contains_key(path) {
            return Ok(());
        }

        let pool = self.pool.clone();
        // Weak: a strong watcher handle stored inside its own registry
        // would never let the router drop
        let watcher = self.watcher.downgrade();
        let routes = Arc::clone(&self.routes);
        let route_path = path.to_string();
        let request_ttl = self.request_ttl;
        let router_id = self.id.clone();
        let subscription =
            self.watcher
                .subscribe_prefix(request_prefix(path), move |key, value| {
                    let Some(record) = value else { return };
                    let Some(watcher) = watcher.upgrade() else { return };
                    serve_remote(
                        &pool,
                        &watcher,
                        &routes,
                        &router_id,
                        &route_path,
                        key,
                        request_ttl,
                        &record,
                    );
                })?;
        serving.insert(path.to_string(), subscription);
        Ok(())
    }

    /// Send a request and wait for its response
    ///
    /// Dispatches to a local handler when one is registered, otherwise
    /// blocks up to the call timeout for a remote responder.
    pub fn send_request(&self, path: &str, method: &str, data: Value) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        self.write_request(path, method, data.clone(), &request_id, false)?;

        let local = self.routes.read().unwrap().get(path).cloned();
        if let Some(handler) = local {
            let request = Request {
                path: path.to_string(),
                method: method.to_string(),
                data,
                request_id,
                stream: None,
            };
            return handler(&request);
        }

        self.await_response(path, &request_id)
    }

    /// Send a streaming request; returns the response stream
    ///
    /// The handler receives the same stream through [`Request::stream`]
    /// and publishes chunks into it; subscribe to consume them.
    pub fn send_request_streaming(
        &self,
        path: &str,
        method: &str,
        data: Value,
    ) -> Result<StreamChannel> {
        let request_id = Uuid::new_v4().to_string();
        let channel = StreamChannel::new(
            self.pool.clone(),
            self.watcher.clone(),
            stream_key(path, &request_id),
        );
        self.write_request(path, method, data.clone(), &request_id, true)?;

        let local = self.routes.read().unwrap().get(path).cloned();
        if let Some(handler) = local {
            let request = Request {
                path: path.to_string(),
                method: method.to_string(),
                data,
                request_id,
                stream: Some(channel.clone()),
            };
            handler(&request)?;
        }
        Ok(channel)
    }

    /// Drop served routes and stop the watcher
    pub fn cleanup(&self) -> Result<()> {
        self.serving.lock().unwrap().clear();
        self.routes.write().unwrap().clear();
        self.watcher.stop()
    }

    fn write_request(
        &self,
        path: &str,
        method: &str,
        data: Value,
        request_id: &str,
        stream: bool,
    ) -> Result<()> {
        let record = Value::map([
            ("method", Value::from(method)),
            ("data", data),
            ("request_id", Value::from(request_id)),
            ("stream", Value::Bool(stream)),
            ("origin", Value::from(self.id.as_str())),
        ]);
        self.pool
            .set(&request_key(path, request_id), &record, Some(self.request_ttl))
    }

    fn await_response(&self, path: &str, request_id: &str) -> Result<Value> {
        let (tx, rx) = mpsc::channel::<Value>();
        let tx = Mutex::new(tx);
        let subscription = self
            .watcher
            .subscribe(response_key(path, request_id), move |value| {
                if let Some(record) = value {
                    let _ = tx.lock().unwrap().send(record);
                }
            })?;

        let outcome = rx.recv_timeout(self.call_timeout);
        subscription.cancel();
        match outcome {
            Ok(record) => parse_response(&record),
            Err(_) => Err(MventError::call_timeout(
                path,
                self.call_timeout.as_millis() as u64,
            )),
        }
    }
}

impl std::fmt::Debug for HttpRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRouter")
            .field("pool", &self.pool.name())
            .field("routes", &self.routes.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

/// Serve one remotely observed request record
fn serve_remote(
    pool: &SharedPool,
    watcher: &EventWatcher,
    routes: &RwLock<HashMap<String, RouteHandler>>,
    router_id: &str,
    path: &str,
    key: &str,
    request_ttl: Duration,
    record: &Value,
) {
    // Requests this router sent were already dispatched to its own
    // handler directly; answering again would double-invoke it
    if record.get("origin").and_then(Value::as_str) == Some(router_id) {
        return;
    }
    let Some(request_id) = record.get("request_id").and_then(Value::as_str) else {
        tracing::warn!(path, "request record without an id");
        return;
    };
    // A nested route shares this path's prefix; only serve exact matches
    if key != request_key(path, request_id) {
        return;
    }
    let Some(handler) = routes.read().unwrap().get(path).cloned() else {
        return;
    };

    let streaming = record.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let request = Request {
        path: path.to_string(),
        method: record
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET")
            .to_string(),
        data: record.get("data").cloned().unwrap_or(Value::Null),
        request_id: request_id.to_string(),
        stream: streaming.then(|| {
            StreamChannel::new(
                pool.clone(),
                watcher.clone(),
                stream_key(path, request_id),
            )
        }),
    };

    let response = match handler(&request) {
        Ok(body) => Value::map([("ok", Value::Bool(true)), ("body", body)]),
        Err(err) => Value::map([
            ("ok", Value::Bool(false)),
            ("error", Value::from(err.to_string())),
        ]),
    };
    if let Err(err) = pool.set(
        &response_key(path, request_id),
        &response,
        Some(request_ttl),
    ) {
        tracing::warn!(path, %err, "failed to write response record");
    }
}

fn parse_response(record: &Value) -> Result<Value> {
    match record.get("ok").and_then(Value::as_bool) {
        Some(true) => Ok(record.get("body").cloned().unwrap_or(Value::Null)),
        Some(false) => Err(MventError::handler(
            record
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown handler failure"),
        )),
        None => Err(MventError::decode("malformed response record")),
    }
}

fn request_prefix(path: &str) -> String {
    format!("req/{}/", path.trim_matches('/'))
}

fn request_key(path: &str, request_id: &str) -> String {
    format!("req/{}/{}", path.trim_matches('/'), request_id)
}

fn response_key(path: &str, request_id: &str) -> String {
    format!("resp/{}/{}", path.trim_matches('/'), request_id)
}

fn stream_key(path: &str, request_id: &str) -> String {
    format!("resp/{}/{}/stream", path.trim_matches('/'), request_id)
}
