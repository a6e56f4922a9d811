use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::{MeetError, Result};
use crate::mesh::{ClientMessage, ServerMessage, SignalingSender};

/// Both halves of an open signaling channel
pub struct SignalingConnection {
    pub sender: SignalingSender,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

/// Signaling endpoint with the auth token appended as a query parameter
pub fn signaling_url(base: &str, token: Option<&str>) -> String {
    match token {
        Some(token) => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{}{}token={}", base, separator, urlencoding::encode(token))
        }
        None => base.to_string(),
    }
}

pub fn encode_frame(message: &ClientMessage) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Parse an inbound text frame; unknown or malformed frames are skipped
pub fn decode_frame(text: &str) -> Option<ServerMessage> {
    match ServerMessage::parse(text) {
        Ok(message) => Some(message),
        Err(e) => {
            tracing::warn!(error = %e, raw_message = %text, "Failed to parse signaling message");
            None
        }
    }
}

/// Open the websocket and spawn its writer and reader tasks.
///
/// The inbound receiver yields `None` once the socket is gone. Calling
/// `disconnect` on the sender closes the socket after pending frames are flushed.
pub async fn connect(url: &str, token: Option<&str>) -> Result<SignalingConnection> {
    let endpoint = signaling_url(url, token);
    let (ws_stream, _) = connect_async(endpoint.as_str())
        .await
        .map_err(|e| MeetError::network(format!("Failed to connect to {}: {}", url, e)))?;
    tracing::info!(url = %url, "Signaling channel connected");

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (sender, mut outbound) = SignalingSender::channel();
    let (inbound_tx, inbound) = mpsc::unbounded_channel::<ServerMessage>();

    // Writer: drain outbound messages until every sender handle is gone
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            let text = match encode_frame(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize signaling message");
                    continue;
                }
            };
            tracing::debug!(frame = %text, "Sending signaling message");
            if let Err(e) = ws_sender.send(Message::Text(text)).await {
                tracing::error!(error = %e, "Failed to send signaling message");
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
        tracing::debug!("Signaling writer finished");
    });

    // Reader: parse frames into the session loop
    tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    if let Some(message) = decode_frame(&text) {
                        if inbound_tx.send(message).is_err() {
                            break;
                        }
                    }
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(frame = ?frame, "Signaling channel closed by server");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Signaling channel error");
                    break;
                }
            }
        }
        tracing::debug!("Signaling reader finished");
    });

    Ok(SignalingConnection { sender, inbound })
}
