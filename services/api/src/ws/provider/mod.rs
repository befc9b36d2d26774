//! Upstream connection setup for the two supported realtime backends.

pub mod realtime;
pub mod voice_live;

use crate::{config::Backend, state::AppState};
use anyhow::{Context, Result, anyhow, bail};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::client::IntoClientRequest,
};
use tracing::{info, instrument};

/// Header used to correlate a client connection with its upstream session.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

/// The websocket connected to the upstream realtime API.
pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backend-specific connection parameters, before authentication.
#[derive(Debug, PartialEq)]
pub struct UpstreamRequest {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
}

/// Joins `path` onto `endpoint`, switches to the matching websocket scheme and
/// replaces the query with `query`.
pub(crate) fn websocket_url(endpoint: &str, path: &str, query: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(endpoint)
        .with_context(|| format!("Invalid upstream endpoint '{}'", endpoint))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("Unsupported upstream endpoint scheme '{}'", other),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("Cannot switch '{}' to the {} scheme", endpoint, scheme))?;
    let base = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{}/{}", base, path));
    url.query_pairs_mut().clear().extend_pairs(query);
    Ok(url)
}

/// Builds the backend-specific upstream request for a new relay session.
pub fn upstream_request(state: &AppState, client_request_id: Option<&str>) -> Result<UpstreamRequest> {
    let config = &state.server_config;
    let model = config
        .model
        .as_deref()
        .context("No upstream deployment or model is configured")?;
    match config.backend {
        Backend::Realtime => {
            realtime::request(&state.endpoint, &config.api_version, model, client_request_id)
        }
        Backend::VoiceLive => {
            voice_live::request(&state.endpoint, &config.api_version, model, client_request_id)
        }
    }
}

/// Opens an authenticated websocket to the configured backend.
#[instrument(skip_all, fields(backend = ?state.server_config.backend))]
pub async fn connect(state: &AppState, client_request_id: Option<&str>) -> Result<UpstreamSocket> {
    let upstream = upstream_request(state, client_request_id)?;
    let (auth_name, auth_value) = state
        .auth
        .header()
        .await
        .context("Upstream authentication failed")?;

    let mut request = upstream.url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(auth_name, auth_value);
    for (name, value) in upstream.headers {
        headers.insert(name, value.parse()?);
    }

    let (socket, response) = connect_async(request)
        .await
        .with_context(|| format!("Failed to connect to {}", upstream.url))?;
    info!(status = %response.status(), "Connected to upstream realtime API.");
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_schemes() {
        let url = websocket_url("http://localhost:8080", "openai/realtime", &[("a", "b")]).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8080/openai/realtime?a=b");

        let url = websocket_url("wss://host/base/", "voice-live/realtime", &[("x", "1 2")]).unwrap();
        assert_eq!(url.as_str(), "wss://host/base/voice-live/realtime?x=1+2");
    }

    #[test]
    fn test_websocket_url_replaces_query() {
        let url = websocket_url("https://host/?stale=1", "openai/realtime", &[("deployment", "d")])
            .unwrap();
        assert_eq!(url.as_str(), "wss://host/openai/realtime?deployment=d");
    }

    #[test]
    fn test_websocket_url_rejects_bad_endpoints() {
        assert!(websocket_url("not a url", "p", &[]).is_err());
        assert!(websocket_url("ftp://host", "p", &[]).is_err());
    }
}
