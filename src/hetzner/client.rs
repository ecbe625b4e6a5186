use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use super::{ServerFilter, ServerRecord};
use crate::http::{Auth, HttpClient, HttpError};

pub const DEFAULT_ENDPOINT: &str = "https://api.hetzner.cloud/v1/";

// page size used for inventory listing, the maximum the API allows is 50
const PER_PAGE: u32 = 50;

#[derive(Debug, Error)]
pub enum HetznerError {
    #[error("inventory API rejected the credentials")]
    Authentication,
    #[error("unexpected status {0}")]
    UnexpectedStatus(StatusCode),
    #[error("invalid API endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),
    #[error("build request failed: {0}")]
    BuildRequest(#[from] http::Error),
    #[error(transparent)]
    Request(#[from] HttpError),
    #[error("read response body failed: {0}")]
    ReadBody(hyper::Error),
    #[error("decode response failed: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ServerRecord>,
    meta: Meta,
}

#[derive(Debug, Deserialize)]
struct Meta {
    pagination: Pagination,
}

#[derive(Debug, Deserialize)]
struct Pagination {
    next_page: Option<u64>,
}

/// Client for the Hetzner Cloud server inventory.
#[derive(Clone, Debug)]
pub struct HetznerClient {
    client: HttpClient,
    endpoint: Url,
    auth: Auth,
}

impl HetznerClient {
    /// `endpoint` must end with a trailing slash, e.g. "https://api.hetzner.cloud/v1/".
    pub fn new(endpoint: &str, token: String) -> Result<Self, HetznerError> {
        let endpoint = Url::parse(endpoint)?;
        let client = HttpClient::new()?;

        Ok(Self {
            client,
            endpoint,
            auth: Auth::bearer(token),
        })
    }

    /// Fetch the complete server inventory. Pages are requested sequentially
    /// in ascending id order until the API reports no next page; every call
    /// is a full re-fetch.
    pub async fn list_servers(
        &self,
        filter: &ServerFilter,
    ) -> Result<Vec<ServerRecord>, HetznerError> {
        let mut servers = Vec::new();
        let mut page = 1u64;

        loop {
            let url = self.page_url(filter, page)?;

            let mut req = Request::get(url.as_str()).body(Full::<Bytes>::default())?;
            self.auth.apply(&mut req);

            let resp = self.client.send(req).await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(match status {
                    StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                        HetznerError::Authentication
                    }
                    status => HetznerError::UnexpectedStatus(status),
                });
            }

            let body = resp
                .into_body()
                .collect()
                .await
                .map_err(HetznerError::ReadBody)?
                .to_bytes();
            let resp = serde_json::from_slice::<ListServersResponse>(&body)?;

            servers.extend(resp.servers);

            match resp.meta.pagination.next_page {
                Some(next) => {
                    trace!(message = "fetching next inventory page", page = next);
                    page = next;
                }
                None => break,
            }
        }

        debug!(message = "fetched servers from inventory", count = servers.len());

        Ok(servers)
    }

    fn page_url(&self, filter: &ServerFilter, page: u64) -> Result<Url, HetznerError> {
        let mut url = self.endpoint.join("servers")?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("sort", "id:asc");
            pairs.append_pair("page", &page.to_string());
            pairs.append_pair("per_page", &PER_PAGE.to_string());

            if let Some(name) = &filter.name {
                pairs.append_pair("name", name);
            }
            if let Some(selector) = &filter.label_selector {
                pairs.append_pair("label_selector", selector);
            }
            if let Some(status) = &filter.status {
                pairs.append_pair("status", status);
            }
        }

        Ok(url)
    }
}
