use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::connection_manager::{ConnectionHandle, OutboundMessage};
use crate::domain::UserId;
use crate::metrics::{
    HandshakeMetrics, WS_CONNECTIONS_CLOSED, WS_CONNECTIONS_OPENED, WS_CONNECTION_DURATION,
};
use crate::ratelimit::RateRule;
use crate::server::AppState;

use super::dispatcher::{Dispatcher, FrameOutcome};
use super::handshake::{client_ip, extract_bearer_protocol};
use super::message::{close_code, ServerMessage};

/// How long a closing connection's writer may keep flushing before it is aborted
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler.
///
/// Rejections still complete the upgrade and then close with a gateway close
/// code, since browsers hide the HTTP status of a failed upgrade.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, headers)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let bearer = extract_bearer_protocol(&headers);

    // Echo the bearer entry so the client accepts the handshake and sees our close code
    let ws = match &bearer {
        Some(bearer) => ws.protocols([bearer.protocol.clone()]),
        None => ws,
    };

    if !state.origins.check(&headers) {
        tracing::warn!("Origin not allowed");
        return reject(ws, "origin", close_code::ORIGIN_FORBIDDEN, "origin not allowed");
    }

    let ip = client_ip(&headers, peer, state.settings.server.trust_forwarded_for);
    if !state
        .hub
        .limiter()
        .check(RateRule::Connect, &ip.to_string())
        .is_allowed()
    {
        tracing::warn!(ip = %ip, "Connection rate exceeded");
        return reject(ws, "rate_limited", close_code::RATE_LIMITED, "rate limited");
    }

    let user_id = match bearer.and_then(|b| state.jwt_validator.verify(&b.token)) {
        Some(user_id) => user_id,
        None => {
            tracing::warn!("Missing or invalid token");
            return reject(ws, "unauthorized", close_code::UNAUTHORIZED, "unauthorized");
        }
    };

    tracing::info!(user_id = user_id, "WebSocket upgrade accepted");

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

fn reject(ws: WebSocketUpgrade, metric: &str, code: u16, reason: &'static str) -> Response {
    HandshakeMetrics::record_rejected(metric);
    ws.on_upgrade(move |mut socket| async move {
        let frame = CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    })
}

/// Handle an established, authenticated WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state),
    fields(otel.kind = "server")
)]
async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let connection_start = Instant::now();
    let ws_config = &state.settings.websocket;

    let (tx, rx) = mpsc::channel::<OutboundMessage>(ws_config.outbound_buffer);
    let handle = state.hub.registry().register(user_id, tx);
    let connection_id = handle.id;
    WS_CONNECTIONS_OPENED.inc();

    let (ws_sender, ws_receiver) = socket.split();
    let ping_interval =
        (ws_config.ping_interval > 0).then(|| Duration::from_secs(ws_config.ping_interval));
    let mut writer = tokio::spawn(write_loop(ws_sender, rx, ping_interval));

    if let Some(hello) = Broadcaster::encode(&ServerMessage::Hello { user_id }) {
        let _ = handle.send(hello).await;
    }

    let dispatcher = Dispatcher::new(state.hub.clone(), ws_config.max_message_bytes);

    let writer_finished = tokio::select! {
        _ = read_loop(&dispatcher, &handle, ws_receiver) => false,
        _ = &mut writer => {
            tracing::debug!(connection_id = %connection_id, "Writer finished first");
            true
        }
    };

    state.hub.registry().unregister(connection_id);

    // Dropping the last sender lets the writer flush what is queued and exit
    drop(dispatcher);
    drop(handle);
    if !writer_finished && !finish_writer(writer, WRITER_DRAIN_TIMEOUT).await {
        tracing::debug!(connection_id = %connection_id, "Writer stalled, aborted");
    }

    WS_CONNECTIONS_CLOSED.inc();
    let duration = connection_start.elapsed().as_secs_f64();
    WS_CONNECTION_DURATION.observe(duration);

    tracing::info!(
        connection_id = %connection_id,
        user_id = user_id,
        duration_secs = duration,
        "WebSocket connection closed"
    );
}

/// Reads frames until the client leaves or a frame forces a close
async fn read_loop(
    dispatcher: &Dispatcher,
    handle: &Arc<ConnectionHandle>,
    mut ws_receiver: futures::stream::SplitStream<WebSocket>,
) {
    while let Some(result) = ws_receiver.next().await {
        let outcome = match result {
            Ok(Message::Text(text)) => dispatcher.handle_frame(handle, text.as_str().as_bytes()).await,
            Ok(Message::Binary(data)) => dispatcher.handle_frame(handle, &data).await,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => FrameOutcome::Continue,
            Ok(Message::Close(_)) => {
                tracing::debug!(connection_id = %handle.id, "Received close frame");
                return;
            }
            Err(e) => {
                tracing::debug!(connection_id = %handle.id, error = %e, "WebSocket receive error");
                return;
            }
        };

        if let FrameOutcome::Close { code, reason } = outcome {
            queue_close(handle, code, reason);
            return;
        }
    }
}

/// Queue a close frame without waiting; a full queue means the client stopped
/// reading and the socket is torn down by [`finish_writer`] instead.
fn queue_close(handle: &ConnectionHandle, code: u16, reason: &'static str) -> bool {
    match handle.try_send(OutboundMessage::Close { code, reason }) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(connection_id = %handle.id, error = %e, "Close frame not queued");
            false
        }
    }
}

/// Wait for the writer to flush, aborting it after `limit`.
/// Returns false if it had to be aborted.
async fn finish_writer(mut writer: JoinHandle<()>, limit: Duration) -> bool {
    match tokio::time::timeout(limit, &mut writer).await {
        Ok(_) => true,
        Err(_) => {
            writer.abort();
            false
        }
    }
}

/// Drains the outbound queue into the socket, pinging on an interval
async fn write_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<OutboundMessage>,
    ping_interval: Option<Duration>,
) {
    let mut ticker = ping_interval
        .map(|period| tokio::time::interval_at(tokio::time::Instant::now() + period, period));

    loop {
        let outbound = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = tick(&mut ticker) => {
                if ws_sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let result = match outbound {
            OutboundMessage::Text(json) => {
                ws_sender
                    .send(Message::Text(String::from(&*json).into()))
                    .await
            }
            OutboundMessage::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: Utf8Bytes::from_static(reason),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection_manager::ConnectionRegistry;

    fn connection(capacity: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (presence_tx, _presence_rx) = mpsc::unbounded_channel();
        let registry = ConnectionRegistry::new(presence_tx);
        let (tx, rx) = mpsc::channel(capacity);
        (registry.register(1, tx), rx)
    }

    #[test]
    fn test_close_is_queued_when_there_is_room() {
        let (handle, mut rx) = connection(4);

        assert!(queue_close(&handle, close_code::MESSAGE_TOO_BIG, "message too big"));
        match rx.try_recv().unwrap() {
            OutboundMessage::Close { code, reason } => {
                assert_eq!(code, close_code::MESSAGE_TOO_BIG);
                assert_eq!(reason, "message too big");
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_does_not_wait_on_full_queue() {
        let (handle, _rx) = connection(1);
        handle
            .try_send(OutboundMessage::Text(Arc::from("{}")))
            .unwrap();

        let queued = tokio::time::timeout(Duration::from_millis(100), async {
            queue_close(&handle, close_code::RATE_LIMITED, "rate limited")
        })
        .await
        .unwrap();
        assert!(!queued);
    }

    #[tokio::test]
    async fn test_stalled_writer_is_aborted() {
        let writer = tokio::spawn(std::future::pending::<()>());
        assert!(!finish_writer(writer, Duration::from_millis(20)).await);

        let writer = tokio::spawn(async {});
        assert!(finish_writer(writer, Duration::from_secs(1)).await);
    }
}
