//! Azure OpenAI realtime endpoint.

use super::{CLIENT_REQUEST_ID_HEADER, UpstreamRequest, websocket_url};
use anyhow::Result;

/// Builds the request for `{endpoint}/openai/realtime`.
///
/// The client request id is forwarded only when the inbound connection
/// carried one.
pub fn request(
    endpoint: &str,
    api_version: &str,
    deployment: &str,
    client_request_id: Option<&str>,
) -> Result<UpstreamRequest> {
    let url = websocket_url(
        endpoint,
        "openai/realtime",
        &[("api-version", api_version), ("deployment", deployment)],
    )?;
    let headers = client_request_id
        .map(|id| (CLIENT_REQUEST_ID_HEADER, id.to_string()))
        .into_iter()
        .collect();
    Ok(UpstreamRequest { url, headers })
}
