use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use http::header::{ALLOW, AUTHORIZATION, WWW_AUTHENTICATE};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use hetzner_sd::discovery::DiscoveryWorker;
use hetzner_sd::hetzner::{HetznerClient, HetznerError, ServerFilter};
use hetzner_sd::http::{Auth, HttpClient};
use hetzner_sd::server::{Router, serve};
use hetzner_sd::store::SnapshotStore;
use hetzner_sd::targets::TargetFormatter;
use hetzner_sd::tls::MaybeTlsListener;

const API_TOKEN: &str = "integration-token";

fn server_json(id: u64, name: &str, ip: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "status": "running",
        "labels": {"env": "test"},
        "public_net": {"ipv4": {"ip": ip}},
        "server_type": {
            "name": "cx22",
            "cores": 2,
            "cpu_type": "shared",
            "disk": 40.0,
            "memory": 4.0,
            "storage_type": "local"
        },
        "datacenter": {
            "name": "fsn1-dc14",
            "location": {"name": "fsn1", "city": "Falkenstein", "country": "DE"}
        }
    })
}

async fn handle_api(
    req: Request<Incoming>,
    seen: Arc<Mutex<Vec<String>>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    seen.lock().unwrap().push(req.uri().to_string());

    let authorized = req
        .headers()
        .get(AUTHORIZATION)
        .is_some_and(|value| value == format!("Bearer {API_TOKEN}").as_str());
    if !authorized {
        return Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Full::default())
            .unwrap());
    }

    // the alternate prefix serves one page with a 2xx status other than 200
    if req.uri().path().starts_with("/alt/") {
        let body = json!({
            "servers": [server_json(9, "worker-9", "192.0.2.9")],
            "meta": {"pagination": {"next_page": null}}
        });

        return Ok(Response::builder()
            .status(StatusCode::NON_AUTHORITATIVE_INFORMATION)
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap());
    }

    let query = req.uri().query().unwrap_or("");
    let body = if query.contains("page=2") {
        json!({
            "servers": [server_json(3, "worker-3", "192.0.2.3")],
            "meta": {"pagination": {"next_page": null}}
        })
    } else {
        json!({
            "servers": [
                server_json(1, "worker-1", "192.0.2.1"),
                server_json(2, "worker-2", "192.0.2.2"),
            ],
            "meta": {"pagination": {"next_page": 2}}
        })
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap())
}

/// A stand-in for the Hetzner API, two pages of servers. Records every
/// request uri it sees.
async fn spawn_mock_api(seen: Arc<Mutex<Vec<String>>>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let (stream, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => break,
            };

            let seen = seen.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| handle_api(req, seen.clone()));
                let _ = Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    addr
}

async fn sync_once(endpoint: &str) -> SnapshotStore {
    let client = HetznerClient::new(endpoint, API_TOKEN.to_string()).unwrap();
    let store = SnapshotStore::new();
    let mut subscription = store.subscribe();

    let shutdown = CancellationToken::new();
    let worker = DiscoveryWorker::new(
        client,
        store.clone(),
        ServerFilter::default(),
        Duration::from_secs(60),
    );
    tokio::spawn(worker.run(shutdown.clone()));

    timeout(Duration::from_secs(5), subscription.wait_for(|v| v.is_some()))
        .await
        .expect("first sync timed out")
        .expect("store closed");
    shutdown.cancel();

    store
}

async fn spawn_server(router: Router, shutdown: CancellationToken) -> SocketAddr {
    let bind = "127.0.0.1:0".parse::<SocketAddr>().unwrap();
    let listener = MaybeTlsListener::bind(&bind, None).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(serve(listener, router).with_graceful_shutdown(shutdown).into_future());

    addr
}

async fn read_json(client: &HttpClient, req: Request<Full<Bytes>>) -> (StatusCode, Value) {
    let resp = client.send(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();

    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn paginated_sync_is_served_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let api = spawn_mock_api(seen.clone()).await;
    let store = sync_once(&format!("http://{api}/")).await;

    // both pages were fetched, sorted by id and 50 at a time
    {
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[0].contains("sort=id%3Aasc"), "{}", seen[0]);
        assert!(seen[0].contains("per_page=50"), "{}", seen[0]);
        assert!(seen[0].contains("page=1"), "{}", seen[0]);
        assert!(seen[1].contains("page=2"), "{}", seen[1]);
    }

    let shutdown = CancellationToken::new();
    let router = Router::new(
        store,
        TargetFormatter {
            node_port: 9100,
            node_network: None,
            label_prefix: "hetzner".to_string(),
        },
        None,
        "/metrics",
        false,
    );
    let addr = spawn_server(router, shutdown.clone()).await;
    let client = HttpClient::new().unwrap();

    let req = Request::get(format!("http://{addr}/sd"))
        .body(Full::default())
        .unwrap();
    let (status, value) = read_json(&client, req).await;
    assert_eq!(status, StatusCode::OK);

    let targets = value
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|group| group["targets"].as_array().unwrap().clone())
        .collect::<Vec<_>>();
    assert_eq!(
        targets,
        vec![
            json!("192.0.2.1:9100"),
            json!("192.0.2.2:9100"),
            json!("192.0.2.3:9100")
        ]
    );
    assert_eq!(value[0]["labels"]["__meta_hetzner_label_env"], "test");

    // unsupported method
    let req = Request::post(format!("http://{addr}/sd"))
        .body(Full::default())
        .unwrap();
    let resp = client.send(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(resp.headers().get(ALLOW).unwrap(), "GET");

    // exposition endpoint serves the recorded series
    let req = Request::get(format!("http://{addr}/metrics"))
        .body(Full::default())
        .unwrap();
    let resp = client.send(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("sync_duration_seconds"), "{text}");

    shutdown.cancel();
}

#[tokio::test]
async fn bearer_gate_challenges_and_accepts() {
    let shutdown = CancellationToken::new();
    let router = Router::new(
        SnapshotStore::new(),
        TargetFormatter {
            node_port: 9100,
            node_network: None,
            label_prefix: "hetzner".to_string(),
        },
        Some(&Auth::bearer("secret".to_string())),
        "/metrics",
        false,
    );
    let addr = spawn_server(router, shutdown.clone()).await;
    let client: HttpClient = HttpClient::new().unwrap();

    let req = Request::get(format!("http://{addr}/sd"))
        .body(Full::default())
        .unwrap();
    let resp = client.send(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers().get(WWW_AUTHENTICATE).unwrap(), "Bearer");

    let req = Request::get(format!("http://{addr}/sd"))
        .header(AUTHORIZATION, "Bearer secret")
        .body(Full::default())
        .unwrap();
    let resp = client.send(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    shutdown.cancel();
}

#[tokio::test]
async fn rejected_credentials_stop_the_worker() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let api = spawn_mock_api(seen.clone()).await;

    let client = HetznerClient::new(&format!("http://{api}/"), "wrong-token".to_string()).unwrap();
    let worker = DiscoveryWorker::new(
        client,
        SnapshotStore::new(),
        ServerFilter::default(),
        Duration::from_secs(60),
    );

    let result = timeout(Duration::from_secs(10), worker.run(CancellationToken::new()))
        .await
        .expect("worker did not return");
    assert!(matches!(result, Err(HetznerError::Authentication)), "{result:?}");
    // no retry after the credentials were rejected
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn non_ok_success_status_is_accepted() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let api = spawn_mock_api(seen.clone()).await;
    let store = sync_once(&format!("http://{api}/alt/")).await;

    let snapshot = store.current().expect("snapshot missing");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "worker-9");
}

#[tokio::test]
async fn failed_sync_is_terminal() {
    // bind and drop straight away to get a port nobody listens on
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = HetznerClient::new(&format!("http://{addr}/"), API_TOKEN.to_string()).unwrap();
    let worker = DiscoveryWorker::new(
        client,
        SnapshotStore::new(),
        ServerFilter::default(),
        Duration::from_secs(60),
    );

    let result = timeout(Duration::from_secs(10), worker.run(CancellationToken::new())).await;
    assert!(result.expect("worker did not return").is_err());
}
