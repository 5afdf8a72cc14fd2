//! HTTP client for the hash path query API.
//!
//! [`HttpHashPathSource`] implements [`HashPathSource`] against a running
//! node, so callers can swap a local [`Server`](hashpath_core::Server) for a
//! remote one.

use async_trait::async_trait;
use hashpath_core::{
    Error, GetHashPathResponse, GetTreeStateResponse, HashPath, HashPathSource, Result, TreeState,
};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Remote [`HashPathSource`]
#[derive(Clone, Debug)]
pub struct HttpHashPathSource {
    base_url: String,
    client: reqwest::Client,
}

impl HttpHashPathSource {
    /// Query the API rooted at `base_url`, e.g. `http://localhost:8080`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    /// Same as [`new`](Self::new) with a preconfigured client
    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    /// API root
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        debug!(%url, "Querying hash path API");

        let response = self.client.get(&url).send().await.map_err(remote)?;
        let status = response.status();
        if status.is_success() {
            return response.json::<T>().await.map_err(remote);
        }

        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(Error::NotStarted);
        }
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        Err(Error::Remote(format!("{status}: {message}")))
    }
}

fn remote(err: reqwest::Error) -> Error {
    Error::Remote(err.to_string())
}

#[async_trait]
impl HashPathSource for HttpHashPathSource {
    async fn get_tree_state(&self) -> Result<TreeState> {
        self.get::<GetTreeStateResponse>("/get-tree-state").await?.try_into()
    }

    async fn get_hash_path(&self, index: u64) -> Result<HashPath> {
        self.get::<GetHashPathResponse>(&format!("/get-hash-path/{index}")).await?.try_into()
    }
}
