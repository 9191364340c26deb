use std::collections::HashMap;

use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use domwatch_core::normalize_domain;

/// Client for the external domain status API (`GET ?domains=a,b`).
#[derive(Clone)]
pub struct LookupClient {
    http: Client,
    base_url: Url,
}

impl LookupClient {
    /// Creates a new lookup client pointing at `base_url`.
    pub fn new(base_url: Url, http: Client) -> Self {
        Self { http, base_url }
    }

    /// Queries the status of one or more domains in a single request.
    ///
    /// Domains missing from the response, or whose entry carries no boolean
    /// `blocked` field, are absent from the returned map. Keys are normalized.
    pub async fn lookup(
        &self,
        domains: &[&str],
    ) -> Result<HashMap<String, LookupVerdict>, LookupError> {
        if domains.is_empty() {
            return Ok(HashMap::new());
        }

        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("domains", &domains.join(","));

        let response = self.http.get(url).send().await?;
        let body: HashMap<String, Value> = parse_json(response).await?;

        Ok(body
            .into_iter()
            .filter_map(|(domain, entry)| {
                let blocked = entry.get("blocked")?.as_bool()?;
                Some((normalize_domain(&domain)?, LookupVerdict { blocked }))
            })
            .collect())
    }
}

/// Per-domain verdict returned by the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupVerdict {
    pub blocked: bool,
}

/// Errors produced by the lookup client.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

async fn parse_json<T>(response: Response) -> Result<T, LookupError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(LookupError::Status { status, body });
    }

    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}
