use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use url::Url;
use vecdata_transport::{FileTransport, HttpTransport, Transport, TransportError};

#[derive(Clone)]
struct Origin {
    data: Arc<Vec<u8>>,
    honor_ranges: bool,
}

async fn data_handler(State(origin): State<Origin>, headers: HeaderMap) -> Response {
    let total = origin.data.len();

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<usize>().ok()?, b.parse::<usize>().ok()?)));

    match range {
        Some((start, end)) if origin.honor_ranges && start < total => {
            let end = end.min(total - 1);
            let body = origin.data[start..=end].to_vec();
            (
                StatusCode::PARTIAL_CONTENT,
                [(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{total}"),
                )],
                body,
            )
                .into_response()
        }
        _ => (StatusCode::OK, origin.data.as_ref().clone()).into_response(),
    }
}

async fn spawn_origin(data: Vec<u8>, honor_ranges: bool) -> SocketAddr {
    let origin = Origin {
        data: Arc::new(data),
        honor_ranges,
    };
    let app = Router::new()
        .route("/base.fvec", get(data_handler))
        .with_state(origin);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    }));

    addr
}

fn payload(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut data = vec![0_u8; len];
    rng.fill(&mut data[..]);
    data
}

fn url_for(addr: SocketAddr) -> Url {
    format!("http://{addr}/base.fvec").parse().unwrap()
}

#[tokio::test]
async fn http_range_fetch_returns_exact_window() {
    let data = payload(64 << 10, 1);
    let addr = spawn_origin(data.clone(), true).await;

    let transport = HttpTransport::new(url_for(addr)).unwrap();
    let response = transport.fetch(1000, 4096).await.unwrap();

    assert_eq!(response.offset(), 1000);
    assert_eq!(response.len(), 4096);
    assert_eq!(response.read_all().await.unwrap(), data[1000..5096]);
}

#[tokio::test]
async fn http_fallback_discards_prefix_when_ranges_ignored() {
    let data = payload(32 << 10, 2);
    let addr = spawn_origin(data.clone(), false).await;

    let transport = HttpTransport::new(url_for(addr)).unwrap();
    let response = transport.fetch(8192, 1024).await.unwrap();

    assert_eq!(response.offset(), 8192);
    assert_eq!(response.len(), 1024);
    assert_eq!(response.read_all().await.unwrap(), data[8192..9216]);
}

#[tokio::test]
async fn http_fetch_clamps_at_end_of_file() {
    let data = payload(10_000, 3);
    let addr = spawn_origin(data.clone(), true).await;

    let transport = HttpTransport::new(url_for(addr)).unwrap();
    let response = transport.fetch(9_000, 4_096).await.unwrap();

    assert_eq!(response.len(), 1_000);
    assert_eq!(response.read_all().await.unwrap(), data[9_000..]);
}

#[tokio::test]
async fn http_missing_resource_is_a_status_error() {
    let addr = spawn_origin(payload(16, 4), true).await;

    let url: Url = format!("http://{addr}/missing.fvec").parse().unwrap();
    let transport = HttpTransport::new(url).unwrap();

    match transport.fetch(0, 16).await {
        Err(TransportError::Status { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn file_fetch_reads_the_window() {
    let dir = TempDir::new().unwrap();
    let data = payload(20_000, 5);
    let path = dir.path().join("vectors.bvec");
    std::fs::write(&path, &data).unwrap();

    let transport = FileTransport::new(&path);
    let response = transport.fetch(5_000, 2_500).await.unwrap();

    assert_eq!(response.offset(), 5_000);
    assert_eq!(response.len(), 2_500);
    assert_eq!(response.read_all().await.unwrap(), data[5_000..7_500]);
}

#[tokio::test]
async fn file_fetch_past_eof_is_empty() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vectors.bvec");
    std::fs::write(&path, payload(100, 6)).unwrap();

    let transport = FileTransport::new(&path);
    let response = transport.fetch(100, 10).await.unwrap();

    assert!(response.is_empty());
    assert!(response.read_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn file_fetch_clamps_tail() {
    let dir = TempDir::new().unwrap();
    let data = payload(100, 7);
    let path = dir.path().join("vectors.bvec");
    std::fs::write(&path, &data).unwrap();

    let transport = FileTransport::new(&path);
    let response = transport.fetch(90, 64).await.unwrap();

    assert_eq!(response.len(), 10);
    assert_eq!(response.read_all().await.unwrap(), data[90..]);
}
