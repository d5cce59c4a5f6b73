use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::progress::{Channel, Connection, Frame, ProgressOrder, ServerMessage, Subscriptions};
use crate::scan::ScanService;
use crate::state::AppState;

/// Requests a connected observer may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { scan_id: String },
    Unsubscribe { scan_id: String },
    Pause { scan_id: String },
    Resume { scan_id: String },
    Cancel { scan_id: String },
}

pub async fn events_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let scans = state.scans.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, scans))
}

async fn handle_socket(socket: WebSocket, scans: ScanService) {
    let connection = scans.broadcaster().connect();
    let subscriptions = connection.subscriptions();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel::<Frame>();
    let (ws_sink, ws_stream) = socket.split();
    debug!("Event stream connected");

    let outgoing = tokio::spawn(forward_outgoing(ws_sink, connection, reply_rx));
    process_incoming(ws_stream, &scans, &subscriptions, &reply_tx).await;

    debug!("Event stream disconnected");
    outgoing.abort();
}

async fn forward_outgoing(
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut connection: Connection,
    mut replies: mpsc::UnboundedReceiver<Frame>,
) {
    let mut order = ProgressOrder::default();
    loop {
        let frame = tokio::select! {
            frame = connection.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            reply = replies.recv() => match reply {
                Some(frame) => frame,
                None => break,
            },
        };
        if !order.admit(&frame) {
            continue;
        }
        match frame.to_json() {
            Ok(json) => {
                if ws_sink.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(err) => error!("Failed to serialize event frame: {}", err),
        }
    }
}

async fn process_incoming(
    mut ws_stream: SplitStream<WebSocket>,
    scans: &ScanService,
    subscriptions: &Subscriptions,
    replies: &mpsc::UnboundedSender<Frame>,
) {
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let frames = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => handle_client_message(message, scans, subscriptions).await,
                    Err(err) => {
                        debug!("Failed to parse client message: {}", err);
                        vec![direct(ServerMessage::Rejected {
                            error: format!("invalid message: {}", err),
                        })]
                    }
                };
                for frame in frames {
                    if replies.send(frame).is_err() {
                        return;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!("Event stream read error: {}", err);
                break;
            }
        }
    }
}

/// Frames to send back to the requesting connection only.
pub async fn handle_client_message(
    message: ClientMessage,
    scans: &ScanService,
    subscriptions: &Subscriptions,
) -> Vec<Frame> {
    match message {
        ClientMessage::Subscribe { scan_id } => {
            let catch_up = subscriptions.subscribe(&scan_id);
            let mut frames = vec![ack("subscribe", &scan_id)];
            if let Some(progress) = catch_up {
                frames.push(Frame {
                    channel: Channel::Scan(scan_id),
                    message: ServerMessage::Progress(progress),
                });
            }
            frames
        }
        ClientMessage::Unsubscribe { scan_id } => {
            subscriptions.unsubscribe(&scan_id);
            vec![ack("unsubscribe", &scan_id)]
        }
        // Scans run to completion or cancellation; these are accepted and ignored.
        ClientMessage::Pause { scan_id } => vec![ack("pause", &scan_id)],
        ClientMessage::Resume { scan_id } => vec![ack("resume", &scan_id)],
        ClientMessage::Cancel { scan_id } => match scans.cancel(&scan_id).await {
            Ok(()) => vec![ack("cancel", &scan_id)],
            Err(err) => vec![direct(ServerMessage::Rejected {
                error: err.to_string(),
            })],
        },
    }
}

fn ack(action: &str, scan_id: &str) -> Frame {
    direct(ServerMessage::Ack {
        action: action.to_string(),
        scan_id: scan_id.to_string(),
    })
}

fn direct(message: ServerMessage) -> Frame {
    Frame {
        channel: Channel::Direct,
        message,
    }
}
