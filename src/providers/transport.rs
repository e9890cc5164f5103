use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::{NexusError, Result};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub fn join_endpoint(base_url: &str, endpoint: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    if base.ends_with(&format!("/{endpoint}")) {
        base.to_string()
    } else {
        format!("{base}/{endpoint}")
    }
}

pub fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

pub fn default_http_client() -> reqwest::Client {
    http_client(DEFAULT_HTTP_TIMEOUT)
}

/// POSTs `body` as JSON and decodes a `200 OK` reply.
///
/// Any other status is a hard failure that carries the upstream body as
/// diagnostic text.
pub(crate) async fn post_json<B, T>(request: reqwest::RequestBuilder, body: &B) -> Result<T>
where
    B: Serialize + ?Sized,
    T: DeserializeOwned,
{
    let response = request.json(body).send().await?;
    let status = response.status();
    if status != reqwest::StatusCode::OK {
        let text = response.text().await.unwrap_or_default();
        return Err(NexusError::Api { status, body: text });
    }
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}
