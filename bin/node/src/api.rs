//! HTTP query API

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hashpath_core::{Error, GetHashPathResponse, GetTreeStateResponse, HashPathSource};
use serde::Serialize;
use tracing::{error, warn};

type SharedSource = Arc<dyn HashPathSource>;

/// Build the query router, nested under `prefix` when non-empty
pub(crate) fn router(source: SharedSource, prefix: &str) -> Router {
    let routes = Router::new()
        .route("/", get(health))
        .route("/get-tree-state", get(get_tree_state))
        .route("/get-hash-path/:index", get(get_hash_path))
        .with_state(source);

    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return routes;
    }
    if prefix.starts_with('/') {
        Router::new().nest(prefix, routes)
    } else {
        Router::new().nest(&format!("/{prefix}"), routes)
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Failure of a single request
#[derive(Debug)]
enum ApiError {
    BadIndex(String),
    Source(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self::Source(err)
    }
}

impl ApiError {
    fn is_bad_request(&self) -> bool {
        match self {
            Self::BadIndex(_) => true,
            Self::Source(err) => err.is_client_error(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            _ if self.is_bad_request() => StatusCode::BAD_REQUEST,
            Self::BadIndex(_) => StatusCode::BAD_REQUEST,
            Self::Source(Error::NotStarted) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Source(err) => {
                error!(%err, "Query failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let error = match self {
            Self::BadIndex(raw) => format!("invalid index {raw:?}"),
            Self::Source(err) => err.to_string(),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

async fn health() -> &'static str {
    "OK\n"
}

async fn get_tree_state(
    State(source): State<SharedSource>,
) -> Result<Json<GetTreeStateResponse>, ApiError> {
    Ok(Json(source.get_tree_state().await?.into()))
}

async fn get_hash_path(
    State(source): State<SharedSource>,
    Path(index): Path<String>,
) -> Result<Json<GetHashPathResponse>, ApiError> {
    let Ok(parsed) = index.parse::<u64>() else {
        warn!(%index, "Rejected hash path query");
        return Err(ApiError::BadIndex(index));
    };
    let path = source.get_hash_path(parsed).await?;
    Ok(Json(GetHashPathResponse::from(&path)))
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use hashpath_core::{
        Block, HashPath, InternalWorldStateDb, KvServerStateDb, LocalBlockSource, Server,
    };
    use hashpath_tree::MemoryStore;
    use tower::ServiceExt;

    use super::*;

    type TestServer = Server<InternalWorldStateDb<MemoryStore>>;

    async fn server(blocks: u64) -> Arc<TestServer> {
        let store = MemoryStore::new();
        let source = LocalBlockSource::new();
        for id in 0..blocks {
            let first = id as u8 * 2;
            source.add_block(Block::new(id, id * 2, vec![[first; 32], [first + 1; 32]])).await.unwrap();
        }
        let world_state = InternalWorldStateDb::open(store.clone()).unwrap();
        Arc::new(Server::new(world_state, KvServerStateDb::new(store), source))
    }

    async fn call(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    async fn call_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let (status, body) = call(app, uri).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(server(0).await, "");
        assert_eq!(call(app, "/").await, (StatusCode::OK, b"OK\n".to_vec()));
    }

    #[tokio::test]
    async fn test_tree_state_and_hash_path() {
        let server = server(2).await;
        server.start().await.unwrap();
        let app = router(server.clone(), "");

        let (status, json) = call_json(app.clone(), "/get-tree-state").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["size"], 4);
        assert_eq!(json["root"], "d75b9c13d280c162faa7fa330e8b424c67dcb6d4c6aa0345e3681016a3a2c446");

        let (status, json) = call_json(app, "/get-hash-path/1").await;
        assert_eq!(status, StatusCode::OK);
        let raw = hex::decode(json["hashPath"].as_str().unwrap()).unwrap();
        let path = HashPath::from_buffer(&raw).unwrap();
        assert_eq!(path, server.get_hash_path(1).await.unwrap());
        assert_eq!(path.depth(), 32);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_prefix() {
        let server = server(1).await;
        server.start().await.unwrap();
        let app = router(server.clone(), "api/");

        let (status, _) = call(app.clone(), "/api/get-tree-state").await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = call(app, "/get-tree-state").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let server = server(0).await;
        let app = router(server.clone(), "");

        let (status, json) = call_json(app.clone(), "/get-tree-state").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(json["error"].is_string());

        server.start().await.unwrap();
        for uri in ["/get-hash-path/-1", "/get-hash-path/abc", "/get-hash-path/4294967296"] {
            let (status, json) = call_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(json["error"].is_string());
        }
        server.stop().await;
    }

    #[test]
    fn test_status_for_each_error() {
        let status = |err: ApiError| err.into_response().status();
        assert_eq!(status(ApiError::BadIndex("x".into())), StatusCode::BAD_REQUEST);
        let out_of_range = Error::IndexOutOfRange { index: 16, depth: 4 };
        assert_eq!(status(out_of_range.into()), StatusCode::BAD_REQUEST);
        assert_eq!(status(Error::NotStarted.into()), StatusCode::SERVICE_UNAVAILABLE);
        let broken = Error::Protocol("closed".into());
        assert_eq!(status(broken.into()), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
