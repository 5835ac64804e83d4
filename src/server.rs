//! Admin WebSocket server.
//!
//! One endpoint per channel on TCP port `4200 + channel`. The protocol, in
//! order: an auth handshake (`Password <pw>` as the first text frame within
//! five seconds), one `system_info` snapshot, then live `notification`
//! frames for every registry change, interleaved with a JSON `"ping"` /
//! `"pong"` heartbeat. Clients invoke actions with `call_action` requests;
//! no response frame exists, effects show up as notifications.
//!
//! Any number of clients may connect; each one authenticates separately and
//! receives the snapshot plus all subsequent notifications in mutation
//! order.

use crate::config::Config;
use crate::events::Event;
use crate::registry::{ActionPath, Notification, SystemInfo};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{borrow::Cow, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, broadcast::error::RecvError, mpsc, oneshot},
    time::{self, Duration, Instant},
};
use tokio_tungstenite::tungstenite::protocol::{
    frame::coding::CloseCode, frame::CloseFrame, Message,
};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

const AUTH_PREFIX: &str = "Password ";

/// Close reasons are fixed by the protocol; the codes come from the
/// private-use range.
fn close_auth() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Library(4000),
        reason: Cow::Borrowed("auth"),
    }))
}

fn close_auth_timeout() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Library(4001),
        reason: Cow::Borrowed("auth_timeout"),
    }))
}

#[derive(Debug)]
struct ServerContext {
    event_tx: mpsc::Sender<Event>,
    notification_tx: broadcast::Sender<Notification>,
    /// SHA-256 of the configured password; `None` rejects every client.
    password_hash: Option<Vec<u8>>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ServerMessage {
    Ping,
    Pong,
    SystemInfo(SystemInfo),
    Notification(Notification),
    Error(ServerError),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ServerError {
    ParseError(String),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClientMessage {
    Ping,
    Pong,
    Request(ClientRequest),
}

#[derive(Debug, Serialize, Deserialize)]
struct ClientRequest {
    request_id: String,
    body: ClientRequestBody,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ClientRequestBody {
    CallAction(ActionPath),
}

/// Bind the admin port and serve clients until the process shuts down.
///
/// # Errors
///
/// Fails when the port cannot be bound.
pub async fn start(
    config: Arc<Config>,
    event_tx: mpsc::Sender<Event>,
    notification_tx: broadcast::Sender<Notification>,
) -> Result<()> {
    let password_hash = config.websocket_password.as_ref().map(|password| {
        Sha256::new()
            .chain_update(password.as_bytes())
            .finalize()
            .to_vec()
    });
    if password_hash.is_none() {
        warn!("no websocket password configured, all admin clients will be rejected");
    }

    let ctx = Arc::new(ServerContext {
        event_tx,
        notification_tx,
        password_hash,
    });

    let addr = ("0.0.0.0", config.admin_port());
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("couldn't bind the admin port {}", config.admin_port()))?;
    info!("admin server listening on port {}", config.admin_port());

    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .context("accepting an admin connection failed")?;
        debug!("admin connection from {peer}");
        tokio::spawn(handle_connection(stream, ctx.clone()));
    }
}

async fn handle_connection(stream: TcpStream, ctx: Arc<ServerContext>) {
    let websocket = match tokio_tungstenite::accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(e) => {
            warn!("websocket handshake failed: {e}");
            return;
        }
    };
    let (mut sink, mut stream) = websocket.split();

    // Auth: the very first frame decides, within the timeout. Nothing is
    // sent to the client before it passes.
    let authenticated = match time::timeout(AUTH_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(Message::Text(frame)))) => verify_auth(&frame, ctx.password_hash.as_deref()),
        Ok(_) => false,
        Err(_) => {
            let _ = sink.send(close_auth_timeout()).await;
            return;
        }
    };
    if !authenticated {
        let _ = sink.send(close_auth()).await;
        return;
    }

    // Subscribe before fetching the snapshot so no notification can slip
    // between the two.
    let mut notification_rx = ctx.notification_tx.subscribe();

    let (reply_tx, reply_rx) = oneshot::channel();
    if ctx
        .event_tx
        .send(Event::FetchSystemInfo { reply_tx })
        .await
        .is_err()
    {
        return;
    }
    let Ok(system_info) = reply_rx.await else {
        return;
    };
    if send_message(&mut sink, &ServerMessage::SystemInfo(system_info))
        .await
        .is_err()
    {
        return;
    }

    let mut last_seen = Instant::now();
    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);

    loop {
        tokio::select!(
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > CLIENT_TIMEOUT {
                    debug!("admin client missed the heartbeat, closing");
                    break;
                }
                if send_message(&mut sink, &ServerMessage::Ping).await.is_err() {
                    break;
                }
            },
            notification = notification_rx.recv() => {
                let notification = match notification {
                    Ok(notification) => notification,
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("admin client lagged, {skipped} notifications were dropped");
                        continue;
                    }
                };
                if send_message(&mut sink, &ServerMessage::Notification(notification))
                    .await
                    .is_err()
                {
                    break;
                }
            },
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => {
                                last_seen = Instant::now();
                                if handle_client_message(&ctx, &mut sink, message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("malformed admin request: {e} -- request was: {text}");
                                let reply = ServerMessage::Error(ServerError::ParseError(e.to_string()));
                                if send_message(&mut sink, &reply).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(_)) | Some(Err(_)) | None => break,
                }
            },
        );
    }
}

async fn handle_client_message<S>(
    ctx: &Arc<ServerContext>,
    sink: &mut S,
    message: ClientMessage,
) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match message {
        ClientMessage::Ping => send_message(sink, &ServerMessage::Pong).await,
        ClientMessage::Pong => Ok(()),
        ClientMessage::Request(request) => {
            debug!(
                "admin request {}: call action",
                request.request_id
            );
            match request.body {
                ClientRequestBody::CallAction(path) => {
                    if ctx.event_tx.send(Event::CallAction { path }).await.is_err() {
                        error!("event loop is gone, dropping admin request");
                    }
                }
            }
            Ok(())
        }
    }
}

async fn send_message<S>(sink: &mut S, message: &ServerMessage) -> Result<()>
where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(message).context("serializing a server message failed")?;
    sink.send(Message::Text(json))
        .await
        .context("sending to the admin client failed")?;
    Ok(())
}

/// Check an auth frame against the configured password hash.
///
/// Passwords are compared as SHA-256 digests so the comparison shape does
/// not depend on how much of the password matched.
fn verify_auth(frame: &str, password_hash: Option<&[u8]>) -> bool {
    let Some(expected) = password_hash else {
        return false;
    };
    let Some(provided) = frame.strip_prefix(AUTH_PREFIX) else {
        return false;
    };
    let provided_hash = Sha256::new().chain_update(provided).finalize();
    *expected == *provided_hash
}
