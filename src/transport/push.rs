//! Push strategy: one WebSocket, reconnected with backoff.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

use super::reconnect::{friendly_error_message, is_retriable_error, ConnectionStatus, ReconnectConfig};
use super::Link;

/// Message asking the backend to push a fresh `device_status_update`.
pub(crate) fn request_status_message() -> Value {
    json!({ "type": "request_status" })
}

/// How one socket session ended.
enum SessionEnd {
    /// Cancelled locally or the manager is gone
    Stopped,
    /// Server closed with 1000
    NormalClose,
    /// Anything else; retry per policy
    Failed(String),
}

pub(crate) async fn run(
    link: Link,
    url: Url,
    policy: ReconnectConfig,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut cancel: oneshot::Receiver<()>,
) {
    let mut failures: u32 = 0;

    loop {
        if !link.set_status(ConnectionStatus::Connecting) {
            return;
        }

        let attempt = tokio::select! {
            _ = &mut cancel => return,
            result = connect_async(url.as_str()) => result,
        };

        let end = match attempt {
            Ok((socket, _response)) => {
                info!(url = %url, "Socket connected");
                failures = 0;
                if !link.set_status(ConnectionStatus::Connected) {
                    return;
                }
                session(&link, socket, &mut outbound, &mut cancel).await
            }
            Err(e) => SessionEnd::Failed(format!("WebSocket connect failed: {e}")),
        };

        let reason = match end {
            SessionEnd::Stopped => return,
            SessionEnd::NormalClose => {
                info!("Socket closed normally by server");
                link.set_status(ConnectionStatus::Disconnected);
                return;
            }
            SessionEnd::Failed(reason) => reason,
        };

        failures += 1;
        warn!(
            error = %reason,
            hint = %friendly_error_message(&reason),
            failures,
            "Socket failure"
        );
        if !link.set_status(ConnectionStatus::Error) {
            return;
        }
        if !is_retriable_error(&reason) {
            warn!("Socket error is not retriable, giving up");
            return;
        }
        if !policy.should_retry(failures) {
            warn!(attempts = failures, "Max reconnection attempts reached");
            return;
        }

        let delay = policy.delay_for_attempt(failures);
        debug!(delay_ms = delay.as_millis() as u64, attempt = failures, "Reconnecting");
        tokio::select! {
            _ = &mut cancel => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn session<S>(
    link: &Link,
    socket: S,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    cancel: &mut oneshot::Receiver<()>,
) -> SessionEnd
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = socket.split();

    if let Err(e) = write
        .send(Message::Text(request_status_message().to_string()))
        .await
    {
        return SessionEnd::Failed(format!("WebSocket send failed: {e}"));
    }

    loop {
        tokio::select! {
            _ = &mut *cancel => {
                let close = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                };
                let _ = write.send(Message::Close(Some(close))).await;
                return SessionEnd::Stopped;
            }
            Some(text) = outbound.recv() => {
                if let Err(e) = write.send(Message::Text(text)).await {
                    return SessionEnd::Failed(format!("WebSocket send failed: {e}"));
                }
            }
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if !link.handle_frame(&text) {
                        return SessionEnd::Stopped;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if !link.handle_frame(&text) {
                            return SessionEnd::Stopped;
                        }
                    }
                    Err(_) => warn!("Dropping non-UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    return match frame {
                        Some(f) if f.code == CloseCode::Normal => SessionEnd::NormalClose,
                        Some(f) => SessionEnd::Failed(format!(
                            "WebSocket connection closed: {} {}",
                            u16::from(f.code),
                            f.reason
                        )),
                        None => SessionEnd::Failed("WebSocket connection closed without code".into()),
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return SessionEnd::Failed(format!("WebSocket error: {e}")),
                None => return SessionEnd::Failed("WebSocket connection closed".into()),
            },
        }
    }
}
