//! Per-connection pumps.
//!
//! Each accepted WebSocket is split into two halves driven by two pumps:
//!
//! - The **read pump** turns inbound frames into broadcast requests to the
//!   hub. It runs on the connection's own task.
//! - The **write pump** drains the connection's outbound queue onto the
//!   socket. It runs as a spawned task and is the only writer of the socket.
//!
//! [`serve`] ties them together. Whichever pump stops first, the connection
//! sends exactly one deregister request to the hub; that drops the queue
//! sender, which ends the write pump with a close frame.
//!
//! # Inbound Frames
//!
//! | Frame  | Handling                                        |
//! |--------|-------------------------------------------------|
//! | Text   | Body becomes the chat message text, verbatim    |
//! | Binary | Treated as text if valid UTF-8, otherwise dropped |
//! | Ping   | Ignored (axum answers with a pong)              |
//! | Pong   | Ignored                                         |
//! | Close  | Ends the read pump                              |

use std::fmt;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, error, info, trace, warn};

use crate::hub::{ConnectionId, HubHandle};
use crate::queue::{outbound_queue, QueueReceiver};
use crate::types::{Identity, Message};

/// How long a connection waits for its write pump to flush after
/// deregistering before aborting it.
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a read pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The peer sent a close frame.
    ClosedByPeer,
    /// The stream ended without a close frame.
    StreamEnded,
    /// Reading from the stream failed.
    StreamError,
    /// The hub is no longer accepting requests.
    HubStopped,
}

/// Why a write pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The outbound queue was closed and fully drained.
    QueueClosed,
    /// Writing to the stream failed.
    SinkError,
}

/// Serves one authenticated WebSocket until either side goes away.
pub async fn serve(socket: WebSocket, identity: Identity, hub: HubHandle, queue_capacity: usize) {
    let (sink, stream) = socket.split();
    run(sink, stream, identity, hub, queue_capacity).await;
}

/// Drives a connection over any sink/stream pair.
///
/// The welcome message is handed straight to the write pump rather than the
/// outbound queue. It is always the first frame the client sees and never
/// takes one of the queue's slots.
pub async fn run<Si, St, E>(
    sink: Si,
    stream: St,
    identity: Identity,
    hub: HubHandle,
    queue_capacity: usize,
) where
    Si: Sink<WsMessage> + Unpin + Send + 'static,
    Si::Error: fmt::Display,
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    let connection = ConnectionId::new();
    let (queue, outbound) = outbound_queue(queue_capacity);
    let welcome = Message::welcome(&identity);

    if hub
        .register(identity.clone(), connection, queue)
        .await
        .is_err()
    {
        warn!(%connection, user_id = %identity.id, "Hub stopped, dropping connection");
        return;
    }

    info!(%connection, user_id = %identity.id, name = %identity.name, "WebSocket client connected");

    let mut writer = tokio::spawn(write_pump(sink, Some(welcome), outbound));
    let mut writer_done = false;

    tokio::select! {
        outcome = read_pump(stream, &hub, &identity, connection) => {
            debug!(%connection, ?outcome, "Read pump stopped");
        }
        result = &mut writer => {
            writer_done = true;
            match result {
                Ok(outcome) => debug!(%connection, ?outcome, "Write pump stopped"),
                Err(err) => error!(%connection, error = %err, "Write pump panicked"),
            }
        }
    }

    if hub.deregister(identity.id.clone(), connection).await.is_err() {
        debug!(%connection, "Hub stopped before deregistration");
    }

    if !writer_done {
        match tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, &mut writer).await {
            Ok(Ok(outcome)) => trace!(%connection, ?outcome, "Write pump drained"),
            Ok(Err(err)) => error!(%connection, error = %err, "Write pump panicked"),
            Err(_) => {
                warn!(%connection, "Write pump did not finish in time, aborting");
                writer.abort();
            }
        }
    }

    info!(%connection, user_id = %identity.id, "WebSocket client disconnected");
}

/// Reads frames until the peer leaves, turning each text payload into a
/// broadcast from `identity`.
pub async fn read_pump<St, E>(
    mut stream: St,
    hub: &HubHandle,
    identity: &Identity,
    connection: ConnectionId,
) -> ReadOutcome
where
    St: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: fmt::Display,
{
    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text.as_str().to_owned(),
            Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(%connection, len = data.len(), "Dropping non-UTF-8 binary frame");
                    continue;
                }
            },
            Ok(WsMessage::Ping(data)) => {
                trace!(%connection, data_len = data.len(), "Received ping");
                continue;
            }
            Ok(WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) => {
                debug!(%connection, "WebSocket client sent close frame");
                return ReadOutcome::ClosedByPeer;
            }
            Err(err) => {
                debug!(%connection, error = %err, "WebSocket read error");
                return ReadOutcome::StreamError;
            }
        };

        trace!(%connection, len = text.len(), "Received chat message");
        if hub.broadcast(connection, identity, text).await.is_err() {
            return ReadOutcome::HubStopped;
        }
    }

    ReadOutcome::StreamEnded
}

/// Writes `welcome` (if any) and then every queued message as a JSON text
/// frame, then a close frame once the queue is closed.
pub async fn write_pump<Si>(
    mut sink: Si,
    welcome: Option<Message>,
    mut queue: QueueReceiver,
) -> WriteOutcome
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: fmt::Display,
{
    if let Some(welcome) = welcome {
        if !send_json(&mut sink, &welcome).await {
            let _ = sink.close().await;
            return WriteOutcome::SinkError;
        }
    }

    while let Some(message) = queue.next().await {
        if !send_json(&mut sink, &message).await {
            let _ = sink.close().await;
            return WriteOutcome::SinkError;
        }
    }

    if let Err(err) = sink.send(WsMessage::Close(None)).await {
        trace!(error = %err, "Failed to send close frame");
    }
    let _ = sink.close().await;
    WriteOutcome::QueueClosed
}

/// Sends one message as a text frame. Returns `false` once the sink is
/// unusable; a message that fails to serialize is skipped.
async fn send_json<Si>(sink: &mut Si, message: &Message) -> bool
where
    Si: Sink<WsMessage> + Unpin,
    Si::Error: fmt::Display,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(err) => {
            error!(error = %err, "Failed to serialize message");
            return true;
        }
    };

    sink.send(WsMessage::Text(json.into()))
        .await
        .map_err(|err| debug!(error = %err, "Failed to send message to WebSocket client"))
        .is_ok()
}
