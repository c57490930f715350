use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, Stream, StreamExt};
use th_session::{ClientMessage, OutputWriter, TerminalSession};
use th_telemetry::metrics::{global_metrics, TERMINAL_SESSIONS_TOTAL};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::http_api::ApiState;
use crate::origin_validation::validate_websocket_origin;

/// Why the inbound side of a connection stopped.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("websocket read error: {0}")]
    Socket(#[from] axum::Error),
}

// ---------------------------------------------------------------------------
// WebSocket Handler
// ---------------------------------------------------------------------------

/// GET /ws -- one terminal session per connection.
///
/// The Origin check happens before the upgrade, so a rejected client never
/// gets a session.
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<ApiState>>,
) -> Response {
    if let Err(status) =
        validate_websocket_origin(&headers, &state.session_config.allowed_origins)
    {
        warn!(origin = ?headers.get("origin"), "rejected terminal WebSocket upgrade");
        return status.into_response();
    }

    ws.on_upgrade(move |socket| {
        let session_id = Uuid::new_v4();
        handle_terminal_ws(socket, state, session_id)
            .instrument(info_span!("terminal_session", %session_id))
    })
    .into_response()
}

async fn handle_terminal_ws(socket: WebSocket, state: Arc<ApiState>, session_id: Uuid) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (output, outbound) = OutputWriter::channel();

    global_metrics().increment_counter(TERMINAL_SESSIONS_TOTAL, &[]);
    info!("terminal WebSocket connected");

    // Task: session output -> WS. The only place frames are written.
    let mut writer_task = tokio::spawn(
        async move {
            while let Ok(msg) = outbound.recv_async().await {
                if ws_sender
                    .send(Message::Text(msg.to_json().into()))
                    .await
                    .is_err()
                {
                    debug!("WebSocket send failed, stopping writer");
                    break;
                }
            }
            let _ = ws_sender.close().await;
        }
        .in_current_span(),
    );

    let mut session = TerminalSession::new(
        session_id,
        Arc::clone(&state.session_config),
        Arc::clone(&state.admission),
        output,
    );

    let outcome = tokio::select! {
        result = receive_loop(&mut ws_receiver, &mut session) => result,
        _ = &mut writer_task => Ok(()),
    };

    match outcome {
        Ok(()) => info!("terminal WebSocket disconnected"),
        Err(e) => warn!("closing terminal session: {e}"),
    }

    tokio::task::block_in_place(move || {
        session.close();
        drop(session);
    });
    writer_task.abort();
}

/// Feed inbound frames to the session in arrival order until the client
/// disconnects or sends something that is not JSON.
///
/// Needs the multi-threaded runtime: each message is handled on the current
/// worker via `block_in_place`.
pub async fn receive_loop<S>(
    receiver: &mut S,
    session: &mut TerminalSession,
) -> Result<(), TransportError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = receiver.next().await {
        let decoded = match frame? {
            Message::Text(text) => ClientMessage::decode(text.as_str().as_bytes())?,
            Message::Binary(data) => ClientMessage::decode(&data)?,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if let Some(msg) = decoded {
            // Launching an app resolves paths, opens a PTY and forks.
            tokio::task::block_in_place(|| session.handle_message(msg));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use th_session::{AdmissionController, SessionConfig};

    fn session() -> (TerminalSession, flume::Receiver<th_session::ServerMessage>) {
        let config = SessionConfig {
            apps_directory: std::env::temp_dir().join("termhost-ws-unit"),
            allowed_apps: Default::default(),
            allowed_origins: vec![],
        };
        let (out, rx) = OutputWriter::channel();
        let session = TerminalSession::new(
            Uuid::new_v4(),
            Arc::new(config),
            Arc::new(AdmissionController::new(1)),
            out,
        );
        rx.try_recv().expect("welcome banner");
        (session, rx)
    }

    fn frames(
        items: Vec<Result<Message, axum::Error>>,
    ) -> impl Stream<Item = Result<Message, axum::Error>> + Unpin {
        futures_util::stream::iter(items)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_frames_reach_session_in_order() {
        let (mut session, rx) = session();
        let mut stream = frames(vec![
            Ok(Message::Text(r#"{"input":"l"}"#.into())),
            Ok(Message::Ping(Vec::new().into())),
            Ok(Message::Text(r#"{"unknown":true}"#.into())),
            Ok(Message::Binary(br#"{"input":"s"}"#.to_vec().into())),
        ]);
        receive_loop(&mut stream, &mut session).await.unwrap();
        let echoed: Vec<String> = rx.try_iter().map(|m| m.output).collect();
        assert_eq!(echoed, ["l", "s"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_frame_stops_loop() {
        let (mut session, rx) = session();
        let mut stream = frames(vec![
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"input":"x"}"#.into())),
        ]);
        receive_loop(&mut stream, &mut session).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_non_json_is_transport_error() {
        let (mut session, _rx) = session();
        let mut stream = frames(vec![Ok(Message::Text("hello".into()))]);
        let err = receive_loop(&mut stream, &mut session).await.unwrap_err();
        assert!(matches!(err, TransportError::Decode(_)));
    }
}
