//! End-to-end relay tests: a real client websocket, the gateway, and a fake
//! upstream realtime service on loopback.

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, accept_hdr_async, connect_async,
    tungstenite::{
        self, Message,
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{HeaderMap, HeaderValue},
    },
};
use voicerag_api::{
    auth::AuthProvider,
    config::{Backend, ServerConfig},
    router::create_router,
    state::AppState,
};
use voicerag_core::{FnTool, ToolRegistry, ToolResult, tool::function_schema};

const WAIT: Duration = Duration::from_secs(5);

type ClientSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Upstream {
    socket: WebSocketStream<TcpStream>,
    uri: String,
    headers: HeaderMap,
}

/// Accepts a single upstream connection, recording its handshake.
async fn fake_upstream() -> (String, oneshot::Receiver<Upstream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut handshake = None;
        let socket = accept_hdr_async(stream, |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            handshake = Some((req.uri().to_string(), req.headers().clone()));
            Ok(resp)
        })
        .await
        .unwrap();
        let (uri, headers) = handshake.unwrap();
        let _ = tx.send(Upstream { socket, uri, headers });
    });
    (endpoint, rx)
}

async fn start_gateway(endpoint: String, lookup_result: ToolResult) -> SocketAddr {
    let tools = ToolRegistry::new().with(FnTool::new(
        "lookup",
        function_schema("lookup", "Look things up", json!({"type": "object"})),
        move |args: Value| {
            assert_eq!(args, json!({"q": "x"}));
            let result = lookup_result.clone();
            async move { Ok::<_, anyhow::Error>(result) }
        },
    ));
    let state = Arc::new(AppState {
        endpoint,
        server_config: Arc::new(ServerConfig {
            model: Some("gpt-4o-realtime-preview".into()),
            voice_choice: Some("shimmer".into()),
            ..ServerConfig::new(Backend::Realtime)
        }),
        tools: Arc::new(tools),
        auth: Arc::new(AuthProvider::ApiKey(SecretString::from("test-key".to_string()))),
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, create_router(state, "/realtime"))
            .await
            .unwrap();
    });
    addr
}

async fn connect_client(addr: SocketAddr) -> ClientSocket {
    let mut request = format!("ws://{}/realtime", addr).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("x-ms-client-request-id", HeaderValue::from_static("req-123"));
    let (client, _) = connect_async(request).await.unwrap();
    client
}

/// Connects a client through a fresh gateway and waits for the upstream leg.
async fn relay(lookup_result: ToolResult) -> (ClientSocket, Upstream) {
    let (endpoint, upstream) = fake_upstream().await;
    let addr = start_gateway(endpoint, lookup_result).await;
    let client = connect_client(addr).await;
    let upstream = timeout(WAIT, upstream).await.unwrap().unwrap();
    (client, upstream)
}

async fn next_json<S>(socket: &mut S) -> Value
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("timed out waiting for a message")
            .expect("socket ended")
            .unwrap();
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

async fn send_json<S>(socket: &mut S, value: Value)
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    socket.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn run_tool_call(upstream: &mut Upstream) {
    let socket = &mut upstream.socket;
    send_json(
        socket,
        json!({
            "type": "conversation.item.created",
            "previous_item_id": "p1",
            "item": {"id": "i2", "type": "function_call", "call_id": "c1", "name": "lookup", "arguments": ""}
        }),
    )
    .await;
    send_json(
        socket,
        json!({"type": "response.function_call_arguments.delta", "call_id": "c1", "delta": "{\"q\":"}),
    )
    .await;
    send_json(
        socket,
        json!({
            "type": "response.output_item.done",
            "item": {"id": "i2", "type": "function_call", "call_id": "c1", "name": "lookup", "arguments": "{\"q\":\"x\"}"}
        }),
    )
    .await;
    send_json(
        socket,
        json!({
            "type": "response.done",
            "response": {"id": "r1", "output": [{"id": "i2", "type": "function_call", "call_id": "c1"}]}
        }),
    )
    .await;
}

#[tokio::test]
async fn test_upstream_handshake_carries_auth_and_request_id() {
    let (_client, upstream) = relay(ToolResult::empty()).await;

    assert_eq!(
        upstream.uri,
        "/openai/realtime?api-version=2024-10-01-preview&deployment=gpt-4o-realtime-preview"
    );
    assert_eq!(upstream.headers["api-key"], "test-key");
    assert_eq!(upstream.headers["x-ms-client-request-id"], "req-123");
}

#[tokio::test]
async fn test_session_update_voice_is_enforced() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    send_json(&mut client, json!({"type": "session.update", "session": {"voice": "x"}})).await;

    let forwarded = next_json(&mut upstream.socket).await;
    assert_eq!(forwarded["type"], "session.update");
    assert_eq!(forwarded["session"]["voice"], "shimmer");
    assert_eq!(forwarded["session"]["tool_choice"], "auto");
    assert_eq!(forwarded["session"]["tools"][0]["name"], "lookup");
}

#[tokio::test]
async fn test_client_destined_tool_result() {
    let (mut client, mut upstream) = relay(ToolResult::client("42")).await;

    run_tool_call(&mut upstream).await;

    let output = next_json(&mut upstream.socket).await;
    assert_eq!(
        output,
        json!({
            "type": "conversation.item.create",
            "item": {"type": "function_call_output", "call_id": "c1", "output": ""}
        })
    );
    assert_eq!(next_json(&mut upstream.socket).await, json!({"type": "response.create"}));

    let notice = next_json(&mut client).await;
    assert_eq!(
        notice,
        json!({
            "type": "extension.middle_tier_tool_response",
            "previous_item_id": "p1",
            "tool_name": "lookup",
            "tool_result": "42"
        })
    );
    let done = next_json(&mut client).await;
    assert_eq!(done["type"], "response.done");
    assert_eq!(done["response"]["output"], json!([]));
}

#[tokio::test]
async fn test_server_destined_tool_result() {
    let (mut client, mut upstream) = relay(ToolResult::server("42")).await;

    run_tool_call(&mut upstream).await;

    let output = next_json(&mut upstream.socket).await;
    assert_eq!(output["item"]["call_id"], "c1");
    assert_eq!(output["item"]["output"], "42");
    assert_eq!(next_json(&mut upstream.socket).await, json!({"type": "response.create"}));

    // The only thing the client sees is the redacted response.done.
    let done = next_json(&mut client).await;
    assert_eq!(done["type"], "response.done");
}

#[tokio::test]
async fn test_session_created_is_redacted() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    send_json(
        &mut upstream.socket,
        json!({
            "type": "session.created",
            "session": {"id": "s1", "instructions": "secret", "tools": [{"name": "lookup"}], "voice": "alloy"}
        }),
    )
    .await;

    let created = next_json(&mut client).await;
    assert_eq!(created["session"]["id"], "s1");
    assert_eq!(created["session"]["instructions"], "");
    assert_eq!(created["session"]["tools"], json!([]));
    assert_eq!(created["session"]["voice"], "shimmer");
}

#[tokio::test]
async fn test_client_binary_frame_is_dropped() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    client
        .send(Message::Binary(vec![0u8, 1, 2, 3].into()))
        .await
        .unwrap();
    send_json(&mut client, json!({"type": "session.update", "session": {}})).await;

    // next_json panics on any non-text frame, so a relayed binary frame fails here.
    let forwarded = next_json(&mut upstream.socket).await;
    assert_eq!(forwarded["type"], "session.update");
}

#[tokio::test]
async fn test_upstream_binary_frame_is_dropped() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    upstream
        .socket
        .send(Message::Binary(vec![9u8; 16].into()))
        .await
        .unwrap();
    send_json(
        &mut upstream.socket,
        json!({"type": "response.audio_transcript.delta", "delta": "hi"}),
    )
    .await;

    let relayed = next_json(&mut client).await;
    assert_eq!(relayed, json!({"type": "response.audio_transcript.delta", "delta": "hi"}));
}

#[tokio::test]
async fn test_client_close_closes_upstream() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    client.close(None).await.unwrap();

    loop {
        match timeout(WAIT, upstream.socket.next()).await.unwrap() {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_upstream_close_closes_client() {
    let (mut client, mut upstream) = relay(ToolResult::empty()).await;

    upstream.socket.close(None).await.unwrap();

    loop {
        match timeout(WAIT, client.next()).await.unwrap() {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
}

#[tokio::test]
async fn test_unreachable_upstream_closes_client_with_error() {
    let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("http://{}", unused.local_addr().unwrap());
    drop(unused);

    let addr = start_gateway(endpoint, ToolResult::empty()).await;
    let mut client = connect_client(addr).await;

    let frame = timeout(WAIT, client.next()).await.unwrap().unwrap().unwrap();
    match frame {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1011),
        other => panic!("expected an error close frame, got {:?}", other),
    }
}
