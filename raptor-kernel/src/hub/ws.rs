//! One WebSocket viewer: a read task that turns frames into hub commands and
//! a write task that drains the viewer's outbound queue.

use super::{Hub, Outbound};
use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, warn};

/// What an inbound text frame asks the hub to do.
#[derive(Debug, PartialEq, Eq)]
pub enum ViewerFrame {
    /// `{"server_id": "<uuid>", ...}`: watch that server from now on.
    Watch(String),
    /// Anything else; re-broadcast to every viewer when relaying is enabled.
    Relay,
}

impl ViewerFrame {
    pub fn classify(text: &str) -> ViewerFrame {
        let Ok(serde_json::Value::Object(fields)) = serde_json::from_str::<serde_json::Value>(text) else {
            return ViewerFrame::Relay;
        };
        match fields.get("server_id").and_then(|v| v.as_str()) {
            Some(server) if !server.is_empty() => ViewerFrame::Watch(server.to_string()),
            _ => ViewerFrame::Relay,
        }
    }
}

pub async fn serve_viewer(socket: WebSocket, hub: Hub) {
    let (tx, mut rx) = hub.outbound_queue();
    let id = match hub.register(tx).await {
        Ok(id) => id,
        Err(e) => {
            warn!("rejecting viewer: {e}");
            return;
        }
    };
    debug!(%id, "viewer connected");

    let (mut sink, mut stream) = socket.split();

    let mut writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if sink.send(Message::Text(payload.to_string().into())).await.is_err() {
                return;
            }
        }
        // Queue closed by the hub: slow consumer or shutdown.
        let _ = sink.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if handle_text(&hub, id, text.as_str()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%id, "viewer socket error: {e}");
                    break;
                }
            },
        }
    }

    if let Err(e) = hub.unregister(id).await {
        debug!(%id, "unregister after hub stop: {e}");
    }
    writer.abort();
    debug!(%id, "viewer disconnected");
}

async fn handle_text(hub: &Hub, id: super::ConnectionId, text: &str) -> Result<(), super::HubError> {
    match ViewerFrame::classify(text) {
        ViewerFrame::Watch(server) => hub.set_affinity(id, server).await,
        ViewerFrame::Relay if hub.relays_viewer_frames() => {
            let payload: Outbound = Arc::from(text);
            hub.broadcast_raw(payload).await
        }
        ViewerFrame::Relay => {
            debug!(%id, "viewer frame dropped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_string_declares_affinity() {
        assert_eq!(
            ViewerFrame::classify(r#"{"server_id":"abc-123","extra":1}"#),
            ViewerFrame::Watch("abc-123".into())
        );
    }

    #[test]
    fn test_other_frames_are_relayed() {
        assert_eq!(ViewerFrame::classify(r#"{"server_id":""}"#), ViewerFrame::Relay);
        assert_eq!(ViewerFrame::classify(r#"{"server_id":42}"#), ViewerFrame::Relay);
        assert_eq!(ViewerFrame::classify(r#"{"chat":"hi"}"#), ViewerFrame::Relay);
        assert_eq!(ViewerFrame::classify("not json"), ViewerFrame::Relay);
        assert_eq!(ViewerFrame::classify(r#"["server_id"]"#), ViewerFrame::Relay);
    }
}
