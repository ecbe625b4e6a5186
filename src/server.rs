//! The serving side: request routing with authentication and method
//! gates, JSON error envelopes and per-request timing.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::header::{ALLOW, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::service::Service;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::http::{Auth, Authorizer};
use crate::metrics::{self, Histogram, Metric, exponential_buckets};
use crate::store::SnapshotStore;
use crate::targets::TargetFormatter;
use crate::tls::MaybeTlsListener;

const TARGETS_PATH: &str = "/sd";

// Nginx's non-standard code for requests the client abandoned before the
// response was sent. Never goes over the wire, only into the metrics.
const CLIENT_CLOSED_REQUEST: u16 = 499;

#[derive(Debug, thiserror::Error)]
enum RequestError {
    #[error("Unauthorized")]
    Unauthorized { challenge: HeaderValue },
    #[error("Method not allowed: Must be GET")]
    MethodNotAllowed,
    #[error("Resource not found")]
    NotFound { path: String },
    #[error("Internal Server Error")]
    Internal,
}

impl RequestError {
    fn status(&self) -> StatusCode {
        match self {
            RequestError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            RequestError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            RequestError::NotFound { .. } => StatusCode::NOT_FOUND,
            RequestError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn title(&self) -> &'static str {
        match self {
            RequestError::Unauthorized { .. } => "Unauthorized",
            RequestError::MethodNotAllowed => "Method not allowed: Must be GET",
            RequestError::NotFound { .. } => "Resource not found",
            RequestError::Internal => "Internal Server Error",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            RequestError::Unauthorized { .. } => None,
            RequestError::MethodNotAllowed => {
                Some("The server only accepts GET requests.".to_string())
            }
            RequestError::NotFound { path } => Some(format!(
                "The server does not provide an endpoint at '{path}'"
            )),
            RequestError::Internal => None,
        }
    }
}

/// The uniform error body, a JSON:API style `errors` array. The `meta`
/// member carries the error chain and is only present in debug mode.
#[derive(Serialize)]
struct ErrorEnvelope {
    errors: Vec<ErrorObject>,
}

#[derive(Serialize)]
struct ErrorObject {
    title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<ErrorMeta>,
}

#[derive(Serialize)]
struct ErrorMeta {
    stack: Vec<String>,
}

fn error_stack(err: &dyn std::error::Error) -> Vec<String> {
    let mut stack = vec![err.to_string()];
    let mut source = err.source();
    while let Some(err) = source {
        stack.push(err.to_string());
        source = err.source();
    }

    stack
}

/// Routes incoming requests. Order of the gates matters, authentication is
/// checked before the method, the method before the path.
#[derive(Clone)]
pub struct Router {
    store: SnapshotStore,
    formatter: Arc<TargetFormatter>,
    authorizer: Option<Arc<Authorizer>>,
    metrics_endpoint: Arc<str>,
    debug: bool,
    durations: Metric<Histogram>,
}

impl Router {
    pub fn new(
        store: SnapshotStore,
        formatter: TargetFormatter,
        auth: Option<&Auth>,
        metrics_endpoint: &str,
        debug: bool,
    ) -> Self {
        let durations = metrics::register_histogram(
            "http_response_duration_seconds",
            "Duration of requests to the web server",
            exponential_buckets(0.001, 2.0, 12),
        );

        Self {
            store,
            formatter: Arc::new(formatter),
            authorizer: auth.map(|auth| Arc::new(auth.authorizer())),
            metrics_endpoint: Arc::from(metrics_endpoint),
            debug,
            durations,
        }
    }

    fn handle<B>(&self, req: &Request<B>) -> Response<Full<Bytes>> {
        if let Some(authorizer) = &self.authorizer
            && !authorizer.authorized(req.headers())
        {
            return self.error_response(RequestError::Unauthorized {
                challenge: authorizer.challenge(),
            });
        }

        if req.method() != Method::GET && req.method() != Method::HEAD {
            return self.error_response(RequestError::MethodNotAllowed);
        }

        let path = req.uri().path();
        if path == self.metrics_endpoint.as_ref() {
            let text = metrics::global_registry().encode();

            return Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(text)))
                .unwrap();
        }

        if path == TARGETS_PATH {
            // Before the first successful synchronization the target list
            // is empty, not an error.
            let groups = match self.store.current() {
                Some(snapshot) => self.formatter.format(&snapshot),
                None => Vec::new(),
            };
            let body = match self.to_json(&groups) {
                Ok(body) => body,
                Err(err) => {
                    error!(message = "failed to serialize target groups", %err);
                    return self.error_response(RequestError::Internal);
                }
            };

            return Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .unwrap();
        }

        self.error_response(RequestError::NotFound {
            path: path.to_string(),
        })
    }

    fn error_response(&self, err: RequestError) -> Response<Full<Bytes>> {
        let envelope = ErrorEnvelope {
            errors: vec![ErrorObject {
                title: err.title().to_string(),
                detail: err.detail(),
                meta: self.debug.then(|| ErrorMeta {
                    stack: error_stack(&err),
                }),
            }],
        };

        let mut builder = Response::builder()
            .status(err.status())
            .header(CONTENT_TYPE, "application/json; charset=utf-8");
        match &err {
            RequestError::Unauthorized { challenge } => {
                builder = builder.header(WWW_AUTHENTICATE, challenge.clone());
            }
            RequestError::MethodNotAllowed => {
                builder = builder.header(ALLOW, Method::GET.as_str());
            }
            RequestError::NotFound { .. } | RequestError::Internal => {}
        }

        // an envelope of plain strings cannot fail to serialize
        let body = self.to_json(&envelope).unwrap_or_default();

        builder.body(Full::new(Bytes::from(body))).unwrap()
    }

    fn to_json<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, serde_json::Error> {
        if self.debug {
            serde_json::to_vec_pretty(value)
        } else {
            serde_json::to_vec(value)
        }
    }
}

impl<B> Service<Request<B>> for Router
where
    B: Send + 'static,
{
    type Response = Response<TimedBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let router = self.clone();

        Box::pin(async move {
            let mut timer = RequestTimer::start(
                router.durations.clone(),
                req.uri().path().to_string(),
                req.method().clone(),
            );
            let resp = router.handle(&req);
            let status = resp.status();

            // header-only response, the connection never polls the body
            if req.method() == Method::HEAD {
                timer.finish(status);
            }

            trace!(
                message = "request handled",
                method = %req.method(),
                path = req.uri().path(),
                status = status.as_u16(),
                peer = ?req.extensions().get::<SocketAddr>(),
            );

            Ok(resp.map(|body| TimedBody::new(body, status, timer)))
        })
    }
}

pin_project_lite::pin_project! {
    /// Response body that stops the request timer once the final frame has
    /// been handed to the connection, so the measured duration covers the
    /// write of the response, not just the routing.
    pub struct TimedBody {
        #[pin]
        inner: Full<Bytes>,
        status: StatusCode,
        timer: RequestTimer,
    }
}

impl TimedBody {
    fn new(inner: Full<Bytes>, status: StatusCode, mut timer: RequestTimer) -> Self {
        // empty bodies are never polled
        if inner.is_end_stream() {
            timer.finish(status);
        }

        Self {
            inner,
            status,
            timer,
        }
    }
}

impl Body for TimedBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let mut this = self.project();

        let frame = ready!(this.inner.as_mut().poll_frame(cx));
        if this.inner.is_end_stream() {
            this.timer.finish(*this.status);
        }

        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Records the request duration on drop. Dropped before the response body
/// was written out, there is no status yet and the request is recorded as
/// abandoned by the client with status 499.
struct RequestTimer {
    durations: Metric<Histogram>,
    start: Instant,
    path: String,
    method: Method,
    status: Option<StatusCode>,
}

impl RequestTimer {
    fn start(durations: Metric<Histogram>, path: String, method: Method) -> Self {
        Self {
            durations,
            start: Instant::now(),
            path,
            method,
            status: None,
        }
    }

    fn finish(&mut self, status: StatusCode) {
        self.status = Some(status);
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        let status = match self.status {
            Some(status) => status.as_u16(),
            None => {
                debug!(
                    message = "client closed the connection before the response was sent",
                    path = %self.path,
                    method = %self.method,
                );

                CLIENT_CLOSED_REQUEST
            }
        };

        self.durations
            .recorder([
                ("path", std::mem::take(&mut self.path).into()),
                ("method", self.method.as_str().to_string().into()),
                ("status", status.to_string().into()),
            ])
            .record(self.start.elapsed().as_secs_f64());
    }
}

pub fn serve<S>(listener: MaybeTlsListener, service: S) -> Serve<S> {
    Serve { listener, service }
}

pub struct Serve<S> {
    listener: MaybeTlsListener,
    service: S,
}

impl<S> Serve<S> {
    pub fn with_graceful_shutdown(self, shutdown: CancellationToken) -> WithGracefulShutdown<S> {
        WithGracefulShutdown {
            listener: self.listener,
            service: self.service,
            shutdown,
        }
    }
}

pub struct WithGracefulShutdown<S> {
    listener: MaybeTlsListener,
    service: S,
    shutdown: CancellationToken,
}

impl<S> IntoFuture for WithGracefulShutdown<S>
where
    S: Service<Request<Incoming>, Response = Response<TimedBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<Error>,
{
    type Output = Result<(), Error>;
    type IntoFuture = BoxFuture<'static, Result<(), Error>>;

    fn into_future(self) -> Self::IntoFuture {
        let WithGracefulShutdown {
            mut listener,
            service,
            shutdown,
        } = self;

        Box::pin(async move {
            loop {
                let (peer, conn) = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    result = listener.accept() => match result {
                        Ok(conn) => (conn.peer_addr(), TokioIo::new(conn)),
                        Err(err) => {
                            error!(
                                message = "accept new connection failed",
                                %err
                            );

                            continue;
                        }
                    }
                };

                let shutdown = shutdown.clone();
                let service = ConnectInfo {
                    peer,
                    inner: service.clone(),
                };
                tokio::spawn(async move {
                    let builder = Builder::new(TokioExecutor::new());
                    let conn = builder.serve_connection_with_upgrades(conn, service);
                    tokio::pin!(conn);

                    tokio::select! {
                        result = conn.as_mut() => {
                            if let Err(err) = result {
                                trace!(
                                    message = "failed to serve http connection",
                                    %peer,
                                    %err
                                );
                            }
                        }
                        _ = shutdown.cancelled() => {
                            conn.as_mut().graceful_shutdown();

                            if let Err(err) = conn.as_mut().await {
                                trace!(
                                    message = "failed to serve http connection",
                                    %peer,
                                    %err
                                );
                            }
                        }
                    }
                });
            }

            Ok(())
        })
    }
}

/// Makes the peer address available to the inner service as a request
/// extension.
struct ConnectInfo<S> {
    peer: SocketAddr,
    inner: S,
}

impl<B, S> Service<Request<B>> for ConnectInfo<S>
where
    S: Service<Request<B>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn call(&self, mut req: Request<B>) -> Self::Future {
        req.extensions_mut().insert(self.peer);
        self.inner.call(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::Value;

    use crate::hetzner::ServerRecord;

    fn formatter() -> TargetFormatter {
        TargetFormatter {
            node_port: 9100,
            node_network: None,
            label_prefix: "hetzner".to_string(),
        }
    }

    fn router(auth: Option<Auth>, debug: bool) -> Router {
        Router::new(SnapshotStore::new(), formatter(), auth.as_ref(), "/metrics", debug)
    }

    async fn send(router: &Router, req: Request<()>) -> Response<TimedBody> {
        router.call(req).await.unwrap()
    }

    async fn body_json(resp: Response<TimedBody>) -> Value {
        use http_body_util::BodyExt;

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_credentials_are_challenged() {
        let router = router(Some(Auth::bearer("squirrel".to_string())), false);

        let req = Request::get("/sd").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            resp.headers().get(WWW_AUTHENTICATE),
            Some(&HeaderValue::from_static("Bearer"))
        );

        let value = body_json(resp).await;
        assert_eq!(value["errors"][0]["title"], "Unauthorized");
        // stack only shows up in debug mode
        assert_eq!(value["errors"][0].get("meta"), None);
    }

    #[tokio::test]
    async fn valid_credentials_are_accepted() {
        let router = router(Some(Auth::bearer("squirrel".to_string())), false);

        let req = Request::get("/sd")
            .header(http::header::AUTHORIZATION, "Bearer squirrel")
            .body(())
            .unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn post_is_rejected() {
        let router = router(None, false);

        let req = Request::post("/sd").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            resp.headers().get(ALLOW),
            Some(&HeaderValue::from_static("GET"))
        );

        let value = body_json(resp).await;
        assert_eq!(
            value["errors"][0]["detail"],
            "The server only accepts GET requests."
        );
    }

    #[tokio::test]
    async fn head_is_accepted() {
        let router = router(None, false);

        let req = Request::head("/sd").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let router = router(None, true);

        let req = Request::get("/nope").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let value = body_json(resp).await;
        assert_eq!(value["errors"][0]["title"], "Resource not found");
        assert_eq!(
            value["errors"][0]["detail"],
            "The server does not provide an endpoint at '/nope'"
        );
        // debug mode carries the error chain
        assert_eq!(value["errors"][0]["meta"]["stack"][0], "Resource not found");
    }

    #[tokio::test]
    async fn targets_are_empty_before_first_sync() {
        let router = router(None, false);

        let req = Request::get("/sd").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!([]));
    }

    #[tokio::test]
    async fn targets_reflect_the_snapshot() {
        let store = SnapshotStore::new();
        let router = Router::new(
            store.clone(),
            formatter(),
            None,
            "/metrics",
            false,
        );

        let record = serde_json::from_value::<ServerRecord>(serde_json::json!({
            "id": 42,
            "name": "worker-1",
            "status": "running",
            "public_net": {"ipv4": {"ip": ""}},
            "server_type": {
                "name": "cx22", "cores": 2, "cpu_type": "shared",
                "disk": 40.0, "memory": 4.0, "storage_type": "local"
            },
            "datacenter": {
                "name": "fsn1-dc14",
                "location": {"name": "fsn1", "city": "Falkenstein", "country": "DE"}
            }
        }))
        .unwrap();
        let record = ServerRecord {
            public_net: crate::hetzner::PublicNet {
                ipv4: Some(crate::hetzner::Address {
                    ip: "192.0.2.10".to_string(),
                }),
                ipv6: None,
            },
            ..record
        };
        store.publish(vec![record]);

        let req = Request::get("/sd").body(()).unwrap();
        let value = body_json(send(&router, req).await).await;
        assert_eq!(value[0]["targets"], serde_json::json!(["192.0.2.10:9100"]));
        assert_eq!(value[0]["labels"]["__meta_hetzner_name"], "worker-1");
    }

    #[tokio::test]
    async fn metrics_exposition() {
        let router = router(None, false);

        let req = Request::get("/sd").body(()).unwrap();
        let _ = send(&router, req).await;

        let req = Request::get("/metrics").body(()).unwrap();
        let resp = send(&router, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("text/plain; version=0.0.4"))
        );
    }

    #[tokio::test]
    async fn completed_response_records_its_status() {
        let router = router(None, false);

        let req = Request::get("/completed").body(()).unwrap();
        let resp = send(&router, req).await;
        let status = resp.status();
        // draining the body is what a connection does when it writes the
        // response out
        let _ = body_json(resp).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let text = metrics::global_registry().encode();
        assert!(text.contains(r#"path="/completed""#), "{text}");
        assert!(text.contains(r#"status="404""#), "{text}");
    }

    #[tokio::test]
    async fn abandoned_response_is_recorded_as_client_closed() {
        let router = router(None, false);

        let req = Request::get("/abandoned").body(()).unwrap();
        let resp = send(&router, req).await;
        // the connection dropped the body before writing it
        drop(resp);

        let text = metrics::global_registry().encode();
        assert!(text.contains(r#"path="/abandoned""#), "{text}");
        assert!(text.contains(r#"status="499""#), "{text}");
    }
}
